pub mod file_crc;
pub mod file_store;
pub mod queue;
pub mod transfer_messages;
