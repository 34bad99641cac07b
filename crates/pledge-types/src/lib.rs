pub mod amount;
pub mod error;
pub mod id;

pub use amount::{TokenAmount, TOKEN_BASE_UNIT, TOKEN_DECIMALS};
pub use error::{PledgeError, Result};
pub use id::{AccountAddress, ActivityId};
