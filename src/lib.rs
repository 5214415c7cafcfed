//! pqwire - a PostgreSQL driver speaking the text wire format.
//!
//! ```no_run
//! # async fn demo() -> pqwire::Result<()> {
//! let driver = pqwire::Driver::new();
//! let mut conn = driver.open("host=localhost user=app dbname=app").await?;
//!
//! let mut stmt = conn.prepare("SELECT $1::int8 + 1").await?;
//! let mut rows = stmt.query(&mut conn, &[&41i64]).await?;
//! if let Some(row) = rows.next_row()? {
//!     assert_eq!(row.get::<i64>(0)?, 42);
//! }
//! conn.close().await
//! # }
//! ```

pub mod driver;
pub mod error;
pub mod pg;
pub mod pool;
pub mod rows;
pub mod scan;


pub use driver::{Connection, Driver, ExecResult, Transaction};
pub use error::{DriverError, Result};
pub use pg::{Notification, Oid, Statement, ToValue, Value};
pub use pool::{ArgumentBuffer, ArgumentPool, PoolStats};
pub use rows::{Column, Row, Rows};
pub use scan::FromValue;
