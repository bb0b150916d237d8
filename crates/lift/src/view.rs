/// Countdown values at or below this many seconds are shown with one decimal.
pub const DECIMAL_COUNTDOWN_THRESHOLD_SECONDS: f32 = 5.0;

/// Push-only presentation sink for the staging zone. Nothing pushed here
/// feeds back into transfer decisions.
pub trait TransferView {
    fn set_membership(&mut self, count: usize, capacity: usize);
    fn set_countdown(&mut self, seconds_remaining: f32);
    fn set_sealed(&mut self, _sealed: bool) {}
}

#[derive(Debug, Default)]
pub struct NullView;

impl TransferView for NullView {
    fn set_membership(&mut self, _count: usize, _capacity: usize) {}
    fn set_countdown(&mut self, _seconds_remaining: f32) {}
}

/// Latest pushed values plus a dirty flag, for transports that broadcast on
/// change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub member_count: usize,
    pub capacity: usize,
    pub seconds_remaining: f32,
    pub sealed: bool,
    dirty: bool,
}

impl ViewState {
    pub fn take_dirty(&mut self) -> bool {
        let was_dirty = self.dirty;
        self.dirty = false;
        was_dirty
    }

    pub fn countdown_text(&self) -> String {
        format_countdown(self.seconds_remaining)
    }

    pub fn membership_text(&self) -> String {
        format_membership(self.member_count, self.capacity)
    }
}

impl TransferView for ViewState {
    fn set_membership(&mut self, count: usize, capacity: usize) {
        if self.member_count != count || self.capacity != capacity {
            self.member_count = count;
            self.capacity = capacity;
            self.dirty = true;
        }
    }

    fn set_countdown(&mut self, seconds_remaining: f32) {
        let clamped = seconds_remaining.max(0.0);
        if format_countdown(self.seconds_remaining) != format_countdown(clamped) {
            self.dirty = true;
        }
        self.seconds_remaining = clamped;
    }

    fn set_sealed(&mut self, sealed: bool) {
        if self.sealed != sealed {
            self.sealed = sealed;
            self.dirty = true;
        }
    }
}

pub fn format_countdown(seconds_remaining: f32) -> String {
    if !seconds_remaining.is_finite() || seconds_remaining < 0.0 {
        return "0s".to_string();
    }
    if seconds_remaining <= DECIMAL_COUNTDOWN_THRESHOLD_SECONDS {
        format!("{seconds_remaining:.1}s")
    } else {
        format!("{}s", seconds_remaining.ceil() as u32)
    }
}

pub fn format_membership(count: usize, capacity: usize) -> String {
    format!("{count}/{capacity}")
}
