//! Explicit transfer item list.
//!
//! One item per line, `<name>[TAB<size>]`. The whole list is parsed before
//! anything is handed to the sender, so a bad line never leads to a partial
//! transfer.

use crate::error::ItemListError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Size reported for items whose size is not known up front.
pub const UNKNOWN_SIZE: i64 = -1;

/// A named unit of data to transfer, relative to the root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub name: String,
    pub size_hint: Option<i64>,
}

impl TransferItem {
    pub fn new(name: impl Into<String>, size_hint: Option<i64>) -> Self {
        Self {
            name: name.into(),
            size_hint: size_hint.filter(|size| *size >= 0),
        }
    }

    /// Size hint, or [`UNKNOWN_SIZE`].
    pub fn size_or_unknown(&self) -> i64 {
        self.size_hint.unwrap_or(UNKNOWN_SIZE)
    }
}

/// Parse a single item-list line. `line_no` is 1-based and only used in errors.
pub fn parse_line(line_no: usize, line: &str) -> Result<TransferItem, ItemListError> {
    let fields: Vec<&str> = line.split('\t').filter(|f| !f.is_empty()).collect();
    match fields.as_slice() {
        [name] => Ok(TransferItem::new(*name, None)),
        [name, size] => {
            let size: i64 = size.parse().map_err(|_| ItemListError::InvalidSize {
                line: line_no,
                value: size.to_string(),
            })?;
            Ok(TransferItem::new(*name, Some(size)))
        }
        _ => Err(ItemListError::FieldCount {
            line: line_no,
            fields: fields.len(),
            text: line.to_string(),
        }),
    }
}

/// Read items until end of input.
pub async fn read_items<R>(reader: R) -> Result<Vec<TransferItem>, ItemListError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut items = Vec::new();
    let mut line_no = 0;

    loop {
        line_no += 1;
        let line = lines
            .next_line()
            .await
            .map_err(|e| ItemListError::Read {
                line: line_no,
                message: e.to_string(),
            })?;
        let Some(line) = line else { break };
        items.push(parse_line(line_no, &line)?);
    }

    tracing::debug!(count = items.len(), "Read explicit item list");
    Ok(items)
}
