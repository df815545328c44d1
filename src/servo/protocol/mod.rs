pub mod group_sync_write;
pub mod packet;
pub mod port_handler;
pub mod protocol_packet_handler;
pub mod registers;
pub mod serial_port;
pub mod servo_def;
