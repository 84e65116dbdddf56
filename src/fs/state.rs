//! Per-path plaintext buffer

/// In-memory plaintext of one open path
///
/// The buffer only grows through `write` and `truncate`, and only shrinks
/// through an explicit `truncate`.
#[derive(Debug, Default)]
pub struct FileState {
    /// Plaintext content
    buffer: Vec<u8>,
    /// Mutated since the last successful flush
    dirty: bool,
    /// Outstanding handles referencing this path
    open_handles: u32,
    /// Handles whose release failed; the kernel has already dropped them
    stranded: u32,
    /// Backing file was removed while open
    unlinked: bool,
}

impl FileState {
    /// Create a state holding `buffer` with a single open handle
    pub fn new(buffer: Vec<u8>) -> Self {
        FileState {
            buffer,
            dirty: false,
            open_handles: 1,
            stranded: 0,
            unlinked: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn content(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn open_handles(&self) -> u32 {
        self.open_handles
    }

    /// A state with no handles has been evicted from its table
    pub fn is_live(&self) -> bool {
        self.open_handles > 0
    }

    pub fn acquire(&mut self) {
        self.open_handles += 1;
    }

    /// Drop one handle, returning how many remain
    pub fn release(&mut self) -> u32 {
        self.open_handles = self.open_handles.saturating_sub(1);
        self.stranded = self.stranded.min(self.open_handles);
        self.open_handles
    }

    /// Record that a handle's release failed and its owner is gone
    pub fn strand(&mut self) {
        if self.stranded < self.open_handles {
            self.stranded += 1;
        }
    }

    /// True when only stranded handles keep the state alive
    pub fn is_orphaned(&self) -> bool {
        self.is_live() && self.stranded == self.open_handles
    }

    /// Hand one stranded handle to a new owner
    pub fn adopt(&mut self) -> bool {
        if self.stranded == 0 {
            return false;
        }
        self.stranded -= 1;
        true
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }

    pub fn mark_unlinked(&mut self) {
        self.unlinked = true;
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end
    pub fn write(&mut self, data: &[u8], offset: usize) {
        let end = offset + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset..end].copy_from_slice(data);
        self.dirty = true;
    }

    /// Resize to exactly `length` bytes, returning whether anything changed
    pub fn truncate(&mut self, length: usize) -> bool {
        if length == self.buffer.len() {
            return false;
        }
        // Vec::resize drops the tail or appends zeroes
        self.buffer.resize(length, 0);
        self.dirty = true;
        true
    }

    /// Up to `length` bytes starting at `offset`, clipped to the buffer end
    pub fn read(&self, offset: usize, length: usize) -> &[u8] {
        if offset >= self.buffer.len() {
            return &[];
        }
        let end = offset.saturating_add(length).min(self.buffer.len());
        &self.buffer[offset..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state() {
        let state = FileState::new(b"abc".to_vec());
        assert_eq!(state.len(), 3);
        assert!(!state.is_dirty());
        assert_eq!(state.open_handles(), 1);
        assert!(state.is_live());
        assert!(!state.is_unlinked());
    }

    #[test]
    fn test_write_grows_exactly() {
        let mut state = FileState::default();
        state.write(b"hello", 0);
        assert_eq!(state.content(), b"hello");
        assert!(state.is_dirty());

        // gap is zero-filled, last byte of data is kept
        state.write(b"xy", 8);
        assert_eq!(state.len(), 10);
        assert_eq!(state.content(), b"hello\0\0\0xy");
    }

    #[test]
    fn test_write_overwrites_in_place() {
        let mut state = FileState::new(b"hello world".to_vec());
        state.write(b"HELLO", 0);
        assert_eq!(state.content(), b"HELLO world");

        state.write(b"worlds!", 6);
        assert_eq!(state.content(), b"HELLO worlds!");
    }

    #[test]
    fn test_truncate_shrink_and_grow() {
        let mut state = FileState::new(b"hello".to_vec());

        assert!(state.truncate(3));
        assert_eq!(state.content(), b"hel");
        assert!(state.is_dirty());

        state.mark_clean();
        assert!(state.truncate(6));
        assert_eq!(state.content(), b"hel\0\0\0");
        assert!(state.is_dirty());
    }

    #[test]
    fn test_truncate_same_length_is_noop() {
        let mut state = FileState::new(b"abc".to_vec());
        assert!(!state.truncate(3));
        assert!(!state.is_dirty());
        assert_eq!(state.content(), b"abc");
    }

    #[test]
    fn test_read_clips_to_end() {
        let state = FileState::new(b"hello".to_vec());
        assert_eq!(state.read(0, 5), b"hello");
        assert_eq!(state.read(3, 100), b"lo");
        assert!(state.read(5, 10).is_empty());
        assert!(state.read(100, 10).is_empty());
        assert_eq!(state.read(1, usize::MAX), b"ello");
    }

    #[test]
    fn test_handle_counting() {
        let mut state = FileState::new(Vec::new());
        state.acquire();
        assert_eq!(state.open_handles(), 2);
        assert_eq!(state.release(), 1);
        assert_eq!(state.release(), 0);
        assert!(!state.is_live());
        assert_eq!(state.release(), 0);
    }

    #[test]
    fn test_stranded_handles() {
        let mut state = FileState::new(Vec::new());
        state.acquire();
        state.strand();
        assert!(!state.is_orphaned());

        // the live owner goes away cleanly
        assert_eq!(state.release(), 1);
        assert!(state.is_orphaned());

        assert!(state.adopt());
        assert!(!state.is_orphaned());
        assert!(!state.adopt());
        assert_eq!(state.open_handles(), 1);

        state.strand();
        state.strand();
        assert!(state.is_orphaned());
        assert_eq!(state.release(), 0);
        assert!(!state.is_orphaned());
    }
}
