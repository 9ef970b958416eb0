//! The generic "find header -> collect N bytes -> find footer -> emit"
//! state machine every framer in this crate is built on.

use crate::buffer::Data;

/// Cap on accumulated header bytes before a cut is declared malformed.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Result of looking for the next cut's header in the accumulated tape.
pub enum HeaderOutcome {
    /// Header parsed and consumed from the front of the tape;
    /// `expected_cut_size` bytes of body follow (0 is valid and
    /// immediately triggers footer processing).
    Found { expected_cut_size: u64 },
    /// Header parsed and consumed, but this cut has no body of its own to
    /// collect at all — whatever tape remains after the header belongs to
    /// a different cut entirely. `TapeCutter` hands that remainder back to
    /// the caller untouched (via `data`) instead of looping back into
    /// `find_header`, which would otherwise try to reparse it as another
    /// header of this same kind. Used by the chunked-transfer handoff.
    FoundHandoff,
    /// Not enough bytes yet; the tape is left untouched and more will be
    /// appended on the next call.
    KeepWaiting,
    /// The header is malformed; the cutter (and its owning framer) is
    /// poisoned.
    Fail,
}

/// Implemented by each framer's body-cutting strategy (length-prefixed
/// body, HTTP content/chunk body, WebSocket frame payload).
pub trait Cut {
    /// Looks for the next header at the front of `tape`. On `Found`, must
    /// advance `tape`'s offset past the consumed header bytes. On
    /// `KeepWaiting` or `Fail`, must leave `tape` untouched.
    fn find_header(&mut self, tape: &mut Data) -> HeaderOutcome;

    /// Feeds up to `expected_cut_size` bytes of body (in one or more
    /// calls, never more than remains) into the current cut.
    fn add_body(&mut self, body: &Data);

    /// Called once the body is fully collected, with whatever tape
    /// immediately follows the body (may be empty, may hold a footer, may
    /// already hold the next message). May advance `tape`'s offset to
    /// strip a fixed-size trailer; implementations whose footer is empty
    /// are no-ops.
    fn find_footer(&mut self, tape: &mut Data);
}

/// Drives a [`Cut`] implementation over a growing tape of bytes.
///
/// Feeding the same overall byte sequence to [`TapeCutter::add_data`] split
/// across any number of calls produces the same sequence of completed cuts
/// as feeding it in one call — no input byte is ever re-parsed once it has
/// been accounted for as header or body.
pub struct TapeCutter<C: Cut> {
    cut: C,
    tape: Data,
    expected_cut_size: u64,
    current_cut_size: u64,
    header_found: bool,
    poisoned: bool,
}

impl<C: Cut> TapeCutter<C> {
    pub fn new(cut: C) -> Self {
        Self {
            cut,
            tape: Data::new(),
            expected_cut_size: 0,
            current_cut_size: 0,
            header_found: false,
            poisoned: false,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn cut(&self) -> &C {
        &self.cut
    }

    pub fn cut_mut(&mut self) -> &mut C {
        &mut self.cut
    }

    /// Feeds `data` through the cutter, advancing its offset past whatever
    /// was consumed as header or body. Any bytes left unconsumed (e.g. a
    /// chunked transfer's body, handed off to a different cutter) remain
    /// visible through `data` for the caller to redirect.
    pub fn add_data(&mut self, data: &mut Data) {
        if self.poisoned {
            return;
        }

        loop {
            let mut repeat = false;

            if !self.header_found {
                self.tape.add(data.current());
                data.add_offset(data.current_size());

                match self.cut.find_header(&mut self.tape) {
                    HeaderOutcome::Found { expected_cut_size } => {
                        self.header_found = true;
                        self.expected_cut_size = expected_cut_size;
                        self.current_cut_size = 0;
                        std::mem::swap(data, &mut self.tape);
                        self.tape = Data::new();
                    }
                    HeaderOutcome::FoundHandoff => {
                        std::mem::swap(data, &mut self.tape);
                        self.tape = Data::new();
                        return;
                    }
                    HeaderOutcome::KeepWaiting => {
                        if self.tape.current_size() > MAX_HEADER_BYTES {
                            self.poisoned = true;
                        }
                        return;
                    }
                    HeaderOutcome::Fail => {
                        self.poisoned = true;
                        return;
                    }
                }
            }

            if self.expected_cut_size == 0 {
                self.on_end_found(data);
                if data.is_empty() {
                    return;
                }
                repeat = true;
            } else {
                let available = if self.current_cut_size + data.current_size() as u64
                    > self.expected_cut_size
                {
                    repeat = true;
                    (self.expected_cut_size - self.current_cut_size) as usize
                } else {
                    data.current_size()
                };

                let mut chunk = data.shallow_copy();
                chunk.set_current_size(available);
                self.cut.add_body(&chunk);
                self.current_cut_size += available as u64;
                data.add_offset(available);

                if self.current_cut_size == self.expected_cut_size {
                    self.on_end_found(data);
                    repeat = true;
                }
            }

            if repeat {
                if data.is_empty() {
                    return;
                }
                continue;
            }
            return;
        }
    }

    fn on_end_found(&mut self, data: &mut Data) {
        self.header_found = false;
        self.expected_cut_size = 0;
        self.current_cut_size = 0;
        self.cut.find_footer(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// `[u8 size][size bytes]`, no footer. Matches the length-prefixed
    /// framer's shape closely enough to exercise the generic machinery.
    struct SizePrefixed {
        bodies: Rc<RefCell<Vec<Vec<u8>>>>,
        current: Vec<u8>,
    }

    impl SizePrefixed {
        fn new(bodies: Rc<RefCell<Vec<Vec<u8>>>>) -> Self {
            Self { bodies, current: Vec::new() }
        }
    }

    impl Cut for SizePrefixed {
        fn find_header(&mut self, tape: &mut Data) -> HeaderOutcome {
            let view = tape.current();
            if view.is_empty() {
                return HeaderOutcome::KeepWaiting;
            }
            let size = view[0];
            tape.add_offset(1);
            HeaderOutcome::Found { expected_cut_size: u64::from(size) }
        }

        fn add_body(&mut self, body: &Data) {
            self.current.extend_from_slice(body.current());
        }

        fn find_footer(&mut self, _tape: &mut Data) {
            self.bodies.borrow_mut().push(std::mem::take(&mut self.current));
        }
    }

    fn feed_and_collect(splits: &[&[u8]]) -> Vec<Vec<u8>> {
        let bodies = Rc::new(RefCell::new(Vec::new()));
        let mut cutter = TapeCutter::new(SizePrefixed::new(bodies.clone()));
        for chunk in splits {
            cutter.add_data(&mut Data::from_slice(chunk));
        }
        assert!(!cutter.is_poisoned());
        Rc::try_unwrap(bodies).unwrap().into_inner()
    }

    #[test]
    fn whole_message_in_one_call() {
        let msg: &[u8] = &[3, b'a', b'b', b'c'];
        assert_eq!(feed_and_collect(&[msg]), vec![b"abc".to_vec()]);
    }

    #[test]
    fn split_byte_by_byte_matches_one_shot() {
        let whole: Vec<u8> = vec![3, b'a', b'b', b'c', 2, b'x', b'y'];
        let one_shot = feed_and_collect(&[&whole]);

        let mut byte_splits = Vec::new();
        for b in &whole {
            byte_splits.push(std::slice::from_ref(b));
        }
        let split = feed_and_collect(&byte_splits);

        assert_eq!(one_shot, split);
        assert_eq!(split, vec![b"abc".to_vec(), b"xy".to_vec()]);
    }

    #[test]
    fn split_inside_header_then_body_then_next_header_in_same_buffer() {
        // header(1) | body(3) split across calls, then a second message
        // arrives fully formed tacked onto the tail of the first body.
        let parts: &[&[u8]] = &[&[3], &[b'a'], &[b'b', b'c', 2, b'x'], &[b'y']];
        assert_eq!(feed_and_collect(parts), vec![b"abc".to_vec(), b"xy".to_vec()]);
    }

    #[test]
    fn zero_length_body_emits_immediately() {
        let msg: &[u8] = &[0, 5, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(feed_and_collect(&[msg]), vec![Vec::new(), b"hello".to_vec()]);
    }

    #[test]
    fn oversized_header_poisons_cutter() {
        struct NeverFound;
        impl Cut for NeverFound {
            fn find_header(&mut self, _tape: &mut Data) -> HeaderOutcome {
                HeaderOutcome::KeepWaiting
            }
            fn add_body(&mut self, _body: &Data) {}
            fn find_footer(&mut self, _tape: &mut Data) {}
        }

        let mut cutter = TapeCutter::new(NeverFound);
        cutter.add_data(&mut Data::from_vec(vec![0u8; MAX_HEADER_BYTES + 1]));
        assert!(cutter.is_poisoned());
    }

    #[test]
    fn fail_header_poisons_cutter() {
        struct AlwaysFail;
        impl Cut for AlwaysFail {
            fn find_header(&mut self, _tape: &mut Data) -> HeaderOutcome {
                HeaderOutcome::Fail
            }
            fn add_body(&mut self, _body: &Data) {}
            fn find_footer(&mut self, _tape: &mut Data) {}
        }

        let mut cutter = TapeCutter::new(AlwaysFail);
        cutter.add_data(&mut Data::from_slice(b"x"));
        assert!(cutter.is_poisoned());
    }
}
