use crate::api::ArchiveApi;
use crate::domain::{Collection, Page, Record, SearchQuery};
use crate::error::ArchiveError;

/// Lazily walks a paged listing by following `next` links. Yields each
/// result in server order and stops after the first error.
pub struct Paginator<T, F>
where
    F: FnMut(Option<&str>) -> Result<Page<T>, ArchiveError>,
{
    fetch: F,
    buffer: std::vec::IntoIter<T>,
    next: Option<String>,
    started: bool,
    done: bool,
}

impl<T, F> Paginator<T, F>
where
    F: FnMut(Option<&str>) -> Result<Page<T>, ArchiveError>,
{
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            buffer: Vec::new().into_iter(),
            next: None,
            started: false,
            done: false,
        }
    }

    fn load_page(&mut self) -> Result<bool, ArchiveError> {
        if self.started && self.next.is_none() {
            return Ok(false);
        }
        let page = (self.fetch)(self.next.as_deref())?;
        self.started = true;
        self.next = page.next.filter(|next| !next.is_empty());
        self.buffer = page.results.into_iter();
        Ok(true)
    }
}

impl<T, F> Iterator for Paginator<T, F>
where
    F: FnMut(Option<&str>) -> Result<Page<T>, ArchiveError>,
{
    type Item = Result<T, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(Ok(item));
            }
            match self.load_page() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

pub fn fetch_records<'a>(
    api: &'a dyn ArchiveApi,
    query: &'a SearchQuery,
) -> impl Iterator<Item = Result<Record, ArchiveError>> + 'a {
    Paginator::new(move |next| api.search_page(query, next))
}

pub fn fetch_collections(
    api: &dyn ArchiveApi,
) -> impl Iterator<Item = Result<Collection, ArchiveError>> + '_ {
    Paginator::new(move |next| api.collections_page(next))
}
