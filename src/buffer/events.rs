use crossbeam::channel::{unbounded, Receiver, Sender};

/// Identity of a buffer within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEventKind {
    /// Content changed
    Changed,
    /// Read, modify or file-operation permission flipped
    PermissionsChanged,
    /// The file changed on disk outside this buffer
    FileChanged,
}

/// "Something changed, re-query the buffer"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferEvent {
    pub buffer: BufferId,
    pub kind: BufferEventKind,
}

/// Fans events out to subscribers; disabled while chaining or saving.
/// A file change signalled while disabled is delivered on re-enabling.
#[derive(Debug)]
pub(crate) struct EventHub {
    buffer: BufferId,
    subscribers: Vec<Sender<BufferEvent>>,
    enabled: bool,
    file_changed: bool,
}

impl EventHub {
    pub(crate) fn new(buffer: BufferId) -> Self {
        Self {
            buffer,
            subscribers: Vec::new(),
            enabled: true,
            file_changed: false,
        }
    }

    pub(crate) fn subscribe(&mut self) -> Receiver<BufferEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled && std::mem::take(&mut self.file_changed) {
            self.emit(BufferEventKind::FileChanged);
        }
    }

    pub(crate) fn emit(&mut self, kind: BufferEventKind) {
        if !self.enabled {
            self.file_changed |= kind == BufferEventKind::FileChanged;
            return;
        }
        let event = BufferEvent {
            buffer: self.buffer,
            kind,
        };
        // drop subscribers whose receiver is gone
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}
