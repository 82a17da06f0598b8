pub mod audit;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod fee_structures;
pub mod fees;
pub mod reports;
pub mod settings;
pub mod students;
