pub mod assigned;
pub mod binding;
pub mod identity;
