//! Three-way string+number quicksort.
//!
//! The input distribution has many records sharing the string key with
//! distinct numbers. A Dutch national flag partition on the string key
//! alone collapses each equal-string group in one pass; the group is
//! then ordered by the cheap numeric key without touching its bytes
//! again.

use std::cmp::Ordering;

use crate::record::{self, Record};

/// Below this length the partition overhead loses to insertion sort.
const INSERTION_SORT_MAX: usize = 32;

/// Partition depth budget; past it the remaining range falls back to a
/// plain comparison sort to keep the stack bounded on adversarial input.
const MAX_DEPTH: usize = 64;

/// Sorts records by the string-then-number order. Not stable; equal
/// records are indistinguishable anyway.
pub fn sort_records(buf: &[u8], records: &mut [Record]) {
    quicksort(buf, records, MAX_DEPTH);
}

fn quicksort(buf: &[u8], mut records: &mut [Record], mut depth: usize) {
    loop {
        let n = records.len();
        if n <= INSERTION_SORT_MAX {
            insertion_sort(buf, records);
            return;
        }
        if depth == 0 {
            records.sort_unstable_by(|a, b| record::compare(a, buf, b, buf));
            return;
        }
        depth -= 1;

        let pivot = median_of_three(buf, records);

        // Dutch national flag partition on the string key: strictly
        // less lands left of `lt`, strictly greater right of `gt`.
        let (mut lt, mut i, mut gt) = (0usize, 0usize, n - 1);
        while i <= gt {
            match records[i].string(buf).cmp(pivot.string(buf)) {
                Ordering::Less => {
                    records.swap(lt, i);
                    lt += 1;
                    i += 1;
                }
                Ordering::Greater => {
                    records.swap(i, gt);
                    if gt == 0 {
                        break;
                    }
                    gt -= 1;
                }
                Ordering::Equal => i += 1,
            }
        }

        // Equal-string region: the numeric key is the whole comparison.
        records[lt..=gt].sort_unstable_by_key(|r| r.number);

        // Recurse into the smaller side, iterate on the larger one to
        // keep the stack logarithmic.
        let (head, rest) = records.split_at_mut(lt);
        let tail = &mut rest[gt + 1 - lt..];
        if head.len() < tail.len() {
            quicksort(buf, head, depth);
            records = tail;
        } else {
            quicksort(buf, tail, depth);
            records = head;
        }
    }
}

fn insertion_sort(buf: &[u8], records: &mut [Record]) {
    for i in 1..records.len() {
        let mut j = i;
        while j > 0 && record::compare(&records[j - 1], buf, &records[j], buf) == Ordering::Greater {
            records.swap(j - 1, j);
            j -= 1;
        }
    }
}

fn median_of_three(buf: &[u8], records: &[Record]) -> Record {
    let mut a = records[0];
    let mut b = records[records.len() / 2];
    let mut c = records[records.len() - 1];
    if b.string(buf) < a.string(buf) {
        std::mem::swap(&mut a, &mut b);
    }
    if c.string(buf) < a.string(buf) {
        std::mem::swap(&mut a, &mut c);
    }
    if c.string(buf) < b.string(buf) {
        std::mem::swap(&mut b, &mut c);
    }
    b
}
