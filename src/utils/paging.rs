use crate::utils::error::{Error, Result};

/// Half-open index range of one page of a sorted listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBounds {
    pub from: usize,
    pub to: usize,
    /// Empty when this page reaches the end of the listing.
    pub next_page_token: String,
}

/// Computes the page of a `len`-element listing selected by a page size and
/// an opaque token. The token is the decimal offset of the first element.
/// A page size of zero or less returns everything from the offset onwards.
pub fn page_bounds(page_size: i32, page_token: &str, len: usize) -> Result<PageBounds> {
    let mut from = 0;
    if !page_token.is_empty() {
        from = page_token
            .parse::<usize>()
            .map_err(|e| Error::InvalidArgument(format!("bad page token {page_token:?}: {e}")))?;
        if from >= len {
            return Ok(PageBounds {
                from: len,
                to: len,
                next_page_token: String::new(),
            });
        }
    }

    let mut to = len;
    let mut next_page_token = String::new();
    if let Ok(size) = usize::try_from(page_size) {
        if size > 0 && from + size < len {
            to = from + size;
            next_page_token = to.to_string();
        }
    }
    Ok(PageBounds {
        from,
        to,
        next_page_token,
    })
}
