pub mod health;
pub mod result;
pub mod test;
pub mod testers;
pub mod work;
