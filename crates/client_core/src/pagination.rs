use shared::domain::{ConversationKey, Message};
use tracing::{debug, warn};

use crate::message_store::MessageStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCursor {
    pub conversation_key: ConversationKey,
    pub offset: usize,
    pub page_size: usize,
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_key: ConversationKey,
    pub skip: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn is_first_page(&self) -> bool {
        self.skip == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOutcome {
    pub fetched: usize,
    pub added: usize,
    pub exhausted: bool,
    pub first_page: bool,
}

/// Backward history loader for one conversation. A fetch is split into
/// [`begin`](Self::begin) and [`complete`](Self::complete) so the request can
/// be awaited without holding the conversation state.
#[derive(Debug, Clone)]
pub struct PaginationController {
    cursor: PaginationCursor,
    in_flight: bool,
}

impl PaginationController {
    pub fn new(conversation_key: ConversationKey, page_size: usize) -> Self {
        Self {
            cursor: PaginationCursor {
                conversation_key,
                offset: 0,
                page_size: page_size.max(1),
                exhausted: false,
            },
            in_flight: false,
        }
    }

    pub fn cursor(&self) -> &PaginationCursor {
        &self.cursor
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.exhausted
    }

    /// Whether a scroll position this close to the top should load older history.
    pub fn should_trigger(&self, scroll_top: f32, threshold: f32) -> bool {
        !self.cursor.exhausted && !self.in_flight && scroll_top < threshold
    }

    /// Returns `None` when exhausted or when a fetch is already in flight.
    pub fn begin(&mut self) -> Option<PageRequest> {
        if self.cursor.exhausted || self.in_flight {
            return None;
        }
        self.in_flight = true;
        Some(PageRequest {
            conversation_key: self.cursor.conversation_key.clone(),
            skip: self.cursor.offset,
            limit: self.cursor.page_size,
        })
    }

    /// Re-requests the newest page when a conversation is shown again. Older
    /// pages already walked stay loaded and the cursor keeps its position.
    pub fn refresh(&mut self) -> Option<PageRequest> {
        if self.in_flight {
            return None;
        }
        self.in_flight = true;
        Some(PageRequest {
            conversation_key: self.cursor.conversation_key.clone(),
            skip: 0,
            limit: self.cursor.page_size,
        })
    }

    pub fn complete(
        &mut self,
        request: &PageRequest,
        page: Vec<Message>,
        store: &mut MessageStore,
    ) -> PageOutcome {
        self.in_flight = false;
        let refreshed = request.is_first_page() && self.cursor.offset > 0;
        if request.skip != self.cursor.offset && !refreshed {
            warn!(
                conversation = %self.cursor.conversation_key,
                request_skip = request.skip,
                offset = self.cursor.offset,
                "pagination: completing a request for an outdated offset"
            );
        }

        let fetched = page.len();
        let short = fetched < self.cursor.page_size;
        if refreshed {
            self.cursor.exhausted |= short;
            self.cursor.offset = self.cursor.offset.max(fetched);
        } else {
            self.cursor.exhausted = short;
            self.cursor.offset += fetched;
        }
        let added = store.merge(page);

        debug!(
            conversation = %self.cursor.conversation_key,
            fetched,
            added,
            offset = self.cursor.offset,
            exhausted = self.cursor.exhausted,
            "pagination: page merged"
        );

        PageOutcome {
            fetched,
            added,
            exhausted: self.cursor.exhausted,
            first_page: request.is_first_page(),
        }
    }

    /// Releases the single-flight guard without touching the cursor.
    pub fn abort(&mut self) {
        self.in_flight = false;
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
