// lumicast-common: shared types and wire protocol for the Lumicast workspace

pub mod protocol;
pub mod types;
