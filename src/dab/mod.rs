pub mod framer;
pub mod mux;
pub mod supervisor;
