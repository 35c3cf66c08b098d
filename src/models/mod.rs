pub mod batch;
pub mod decimal;
pub mod order;
pub mod pair;
pub mod trade;
pub mod user;

pub use batch::*;
pub use decimal::{AMOUNT_SCALE, DecimalError, PRICE_SCALE};
pub use order::*;
pub use pair::*;
pub use trade::*;
pub use user::*;
