pub mod decoder;
pub mod scanner;
pub mod transport;

#[cfg(test)]
pub mod mock;
