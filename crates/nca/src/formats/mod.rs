pub mod nca;
pub mod ticket;
