//! Tabular Data Stream client
//!
//! Speaks TDS 5.0 to Sybase servers and TDS 7.0, 7.1 and 7.2 to SQL Server.
//! One [`Session`] multiplexes any number of request/response exchanges,
//! each read lazily as a [`LogicalStream`] of tokens.
//!
//! # Examples
//!
//! Batch and rows:
//!
//! ```no_run
//! use tdsro::{Config, Session};
//!
//! # async fn app() -> tdsro::Result<()> {
//! let session = Session::connect(Config::from_env()).await?;
//!
//! let mut stream = session
//!     .execute(tdsro::Batch::new("SELECT name FROM sys.tables WHERE object_id > ?").bind(100))
//!     .await?;
//!
//! while let Some(row) = stream.next_row().await? {
//!     let name: String = row.try_get("name")?;
//!     println!("{name}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Procedure call with an output parameter:
//!
//! ```no_run
//! use tdsro::{Param, ProcedureCall, Session, SqlType};
//!
//! # async fn app(session: Session) -> tdsro::Result<()> {
//! let call = ProcedureCall::new("sp_answer")
//!     .bind("question")
//!     .param(Param::output(SqlType::Int).named("@answer"));
//!
//! let mut stream = session.execute(call).await?;
//! stream.finish().await?;
//!
//! let answer = stream.param_by_name("answer").and_then(|p| p.output_value().as_value().cloned());
//! # Ok(())
//! # }
//! ```
//!
//! Transactions:
//!
//! ```no_run
//! # async fn app(session: tdsro::Session) -> tdsro::Result<()> {
//! session.begin_transaction().await?;
//! let savepoint = session.savepoint(Some("before insert")).await?;
//!
//! let result = session.execute("INSERT INTO foo VALUES (1)").await?.finish().await;
//! match result {
//!     Ok(_) => session.commit().await?,
//!     Err(_) => {
//!         session.rollback_to(&savepoint).await?;
//!         session.commit().await?;
//!     },
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod net;

// Protocol
pub mod tds;
pub mod codec;

// Connection
pub mod transport;
pub mod mux;

// Encoding
pub mod value;
pub mod types;
pub mod param;
mod encode;
pub mod sql;

// Decoding
pub mod row;
pub mod message;
pub mod token;
mod decode;

// Operation
pub mod session;

mod error;


pub use value::{ColumnValue, DateTime, Numeric, Value};
pub use param::{Direction, Param, SqlType};
pub use row::{Decode, DecodeError, FromRow, Row};
pub use message::{MessageChain, ServerMessage};
pub use token::Token;

pub use net::Socket;
pub use session::{
    Batch, CancelHandle, Config, LogicalStream, ProcedureCall, Request, Savepoint, Session, State,
};
pub use error::{
    Cancelled, ConnectionLost, Error, ErrorKind, ResourceExhausted, Result, Timeout, UsageError,
};
