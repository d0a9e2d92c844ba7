/// MIME parsing and body decoding
///
/// - [`parser`]: multipart splitting and transfer decoding
/// - [`sniff`]: classifier chain for binary payloads
/// - [`dmarc`]: DMARC aggregate report rendering
/// - [`decoder`]: picks the stored body and parks attachments
pub mod decoder;
pub mod dmarc;
pub mod parser;
pub mod sniff;
pub mod types;

pub use decoder::{escape_html, speculative_base64, ContentDecoder, DecodedBody, PgpDecryptor};
pub use dmarc::DmarcReport;
pub use parser::MimeParser;
pub use sniff::{Content, Sniffer};
pub use types::{MimePart, ParsedEmail};
