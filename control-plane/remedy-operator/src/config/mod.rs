mod types;

pub use types::RemedyConfig;
