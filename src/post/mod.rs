pub mod codec;
pub mod master_post_office;
pub mod message;
pub mod post_office;
pub mod session;
