mod env;

pub use env::Env;
