//! Reader for Frostbite 2 game containers: TOC/superbundle catalogs,
//! content-addressed storage, EBX descriptors, and the asset drivers
//! built on top of them. Strictly an extractor; nothing here re-encodes
//! or repacks game data.

pub mod assets;
pub mod cat;
pub mod console;
pub mod dbo;
pub mod dump;
pub mod ebx;
pub mod error;
pub mod frame;
pub mod fsutil;
pub mod guid;
pub mod noncas;
pub mod superbundle;
pub mod xor;
