pub mod codegen;
pub mod common;
pub mod ir;
pub mod kernel;
pub mod outline;
pub mod pprint;
pub mod rewrite;
pub mod stage;
pub mod transforms;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;
