pub mod udp;
pub mod tcp;
pub mod lan;
pub mod memory;
