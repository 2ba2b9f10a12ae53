pub mod parser;
pub use parser::{Control, ParseError, Parser, Settings};

pub mod response;
pub use response::RESPONSE;
