//! Built-in stage handlers.
//!
//! | Handler id | Input | Output |
//! |------------|-------|--------|
//! | `crawler` | `web://<source>?query=..&limit=..` | `{"docs": [...]}` |
//! | `parser` | crawled docs | text blocks joined by the `separator` arg |
//! | `chunker` | parsed text | `{"<uuid>": "<sentence>", ...}` |
//! | `extractor` | chunks | `{"chunks": [...], "entities": [...]}` |

mod chunker;
mod crawler;
mod extractor;
mod parser;

pub use chunker::{split_sentences, ChunkerHandler};
pub use crawler::{CrawlerHandler, WEB_SCHEME};
pub use extractor::{extract_entities, ExtractorHandler};
pub use parser::{format_document, ParserHandler, DEFAULT_SEPARATOR};
