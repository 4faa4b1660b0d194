pub mod core;
pub mod fees;
pub mod installments;
pub mod payments;
pub mod settings;
pub mod students;
