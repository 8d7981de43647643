pub mod account;
pub mod mirror;

pub use account::{parse_deposit_account, DepositAccount};
pub use mirror::LiquidMirror;
