pub mod listing;
pub mod order;
pub mod order_note;
pub mod user;
