mod clock;
mod note;
mod registry;
mod scheduler;

pub use clock::{Callback, CancelHandle, ManualClock, PlaybackClock, SystemClock};
pub use note::{MAX_PITCH, NoteError, NoteEvent, NoteId, piece_duration, sort_by_start};
pub use registry::{ActiveNoteRecord, ActiveNoteRegistry, NoteState};
pub use scheduler::{
    Collaborators, NoteTiming, PlaybackParams, PresentationParams, ScheduleError, Scheduler,
};
