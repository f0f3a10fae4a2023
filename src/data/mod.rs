mod loader;

pub use loader::{BatchSource, IterSource, Repeat, VecSource};
