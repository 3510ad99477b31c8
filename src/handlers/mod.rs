pub mod access;
pub mod intake;
pub mod stylist;
