//! Completion handler capability.

/// Receives the bytes of a finished transfer.
///
/// Called on the pump thread. `data` is only valid for the duration of the
/// call: inbound buffers are handed straight back to the transport for the
/// next trace.
pub trait TransferHandler: Send {
    fn on_complete(&mut self, data: &[u8]);
}

impl<F> TransferHandler for F
where
    F: FnMut(&[u8]) + Send,
{
    fn on_complete(&mut self, data: &[u8]) {
        self(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        bytes: usize,
    }

    impl TransferHandler for Counter {
        fn on_complete(&mut self, data: &[u8]) {
            self.bytes += data.len();
        }
    }

    #[test]
    fn test_closure_and_struct_handlers() {
        let mut seen = Vec::new();
        {
            let mut h = |data: &[u8]| seen.push(data.len());
            h.on_complete(&[0u8; 585]);
            h.on_complete(&[]);
        }
        assert_eq!(seen, vec![585, 0]);

        let mut boxed: Box<dyn TransferHandler> = Box::new(Counter { bytes: 0 });
        boxed.on_complete(&[1, 2, 3]);
    }
}
