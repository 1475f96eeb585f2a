pub mod info;
pub mod kinds;
pub mod run;
pub mod validate;
