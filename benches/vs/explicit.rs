use std::path::Path;

use sumstats::{Parser, ParserConfig, Reader};

pub fn parse_line(parser: &Parser, line: &str) {
    parser.parse(line).unwrap();
}

pub fn iterate<P: AsRef<Path>>(path: P) {
    let reader = Reader::from_path(path, ParserConfig::standard());
    reader.iter().unwrap().for_each(|record| {
        record.unwrap().pvalue();
    });
}

pub fn filter_chrom<P: AsRef<Path>>(path: P) {
    let mut reader = Reader::from_path(path, ParserConfig::standard());
    reader.add_filter("chrom", "X");
    reader.iter().unwrap().for_each(|record| {
        record.unwrap().pos();
    });
}
