pub mod admin;
pub mod health;
pub mod openai;
pub mod ws;
