pub mod commands;
pub mod connection;
pub mod modbus;
pub mod registers;
pub mod sync;
