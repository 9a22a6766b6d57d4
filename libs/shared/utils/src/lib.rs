pub mod extractor;
pub mod jwt;
pub mod signature;
pub mod test_utils;
