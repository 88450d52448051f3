use std::collections::VecDeque;

use layerlift_delta::wire::FileRequest;
use parking_lot::Mutex;

/// Requests the client sent for content it is blocked on. Filled by the
/// channel's reader task, drained by the body writer.
#[derive(Default)]
pub struct FileRequestQueue {
    inner: Mutex<VecDeque<FileRequest>>,
}

impl FileRequestQueue {
    pub fn push(&self, request: FileRequest) {
        self.inner.lock().push_back(request);
    }

    pub fn pop(&self) -> Option<FileRequest> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
