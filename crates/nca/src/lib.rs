pub use binrw;

pub mod crypto;
pub mod formats;
pub mod gamecard;
pub mod hexstring;
pub mod ids;
pub mod storage;
