use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use lexsort::{ExternalSorterBuilder, SortProgress};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let chunk_size: Option<&str> = arg_parser.value_of("chunk_size");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let merge_width: Option<usize> = arg_parser
        .is_present("merge_width")
        .then(|| arg_parser.value_of_t_or_exit("merge_width"));

    let mut sorter_builder = ExternalSorterBuilder::new();
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_parallel_degree(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(chunk_size) = chunk_size {
        sorter_builder = sorter_builder.with_chunk_size(
            chunk_size.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
        );
    }

    if let Some(merge_width) = merge_width {
        sorter_builder = sorter_builder.with_merge_width(merge_width);
    }

    sorter_builder = sorter_builder.with_progress(report_progress);

    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = sorter.sort(path::Path::new(input), path::Path::new(output)) {
        log::error!("sorting error: {}", err);
        process::exit(1);
    }
}

fn report_progress(progress: SortProgress) {
    log::debug!(
        "{:?}: {}/{}",
        progress.phase,
        progress.current,
        progress.total
    );
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("lexsort")
        .about("external merge sort for numbered line files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of workers to use for parallel chunk sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("chunk size (derived from available memory when omitted)")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Chunk size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("merge_width")
                .short('w')
                .long("merge-width")
                .help("how many sorted runs one merge combines")
                .takes_value(true)
                .validator(|v| match v.parse::<usize>() {
                    Ok(width) if width >= 2 => Ok(()),
                    Ok(_) => Err("Merge width must be at least 2".to_string()),
                    Err(err) => Err(format!("Merge width format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
