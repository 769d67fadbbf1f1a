//! Hash photo collections, find duplicates and sort pictures into a dated
//! folder tree without copying the same picture twice.

pub mod core;
pub mod hashmap;
pub mod scanner;

#[cfg(test)]
mod test_support;
