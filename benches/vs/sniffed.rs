use std::path::Path;

use sumstats::{Reader, Sniffer};

pub fn iterate<P: AsRef<Path>>(path: P) {
    let reader = Reader::from_path(path, Sniffer::new());
    reader.iter().unwrap().for_each(|record| {
        record.unwrap().pvalue();
    });
}

pub fn filter_chrom<P: AsRef<Path>>(path: P) {
    let mut reader = Reader::from_path(path, Sniffer::new());
    reader.add_filter("chrom", "X");
    reader.iter().unwrap().for_each(|record| {
        record.unwrap().pos();
    });
}
