pub mod explicit;
pub mod sniffed;
