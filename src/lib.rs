pub mod servo;
