use hookscope_process::Upid;
use std::collections::HashMap;
use tracing::debug;

/// What a deployment pass concluded about one UPID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Something new was attached or published.
    NewWork,
    /// Examined, nothing new found.
    NoNewWork,
    /// Could not be examined; retry next pass without penalty.
    TransientFailure,
}

#[derive(Debug, Clone, Copy)]
struct RescanState {
    multiplier: u32,
    next_eligible: u64,
    mmap_dirty: bool,
}

impl Default for RescanState {
    fn default() -> Self {
        Self {
            multiplier: 1,
            next_eligible: 0,
            mmap_dirty: false,
        }
    }
}

/// Per-UPID rescan gating with exponential backoff.
///
/// Quiet processes get examined less and less often (multiplier grows
/// by the configured factor per uneventful pass, up to the ceiling);
/// an mmap notification marks the UPID dirty, which makes the next
/// pass reconsider it unconditionally and resets the backoff.
#[derive(Debug)]
pub struct RescanScheduler {
    factor: f64,
    ceiling: u32,
    iteration: u64,
    states: HashMap<Upid, RescanState>,
}

impl RescanScheduler {
    pub fn new(factor: f64, ceiling: u32) -> Self {
        Self {
            factor: factor.max(1.0),
            ceiling: ceiling.max(1),
            iteration: 0,
            states: HashMap::new(),
        }
    }

    /// Drop all state (init / re-init path).
    pub fn reset(&mut self) {
        self.iteration = 0;
        self.states.clear();
    }

    pub fn begin_pass(&mut self) {
        self.iteration += 1;
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Should this UPID be examined in the current pass? Unknown UPIDs
    /// and mmap-dirty ones always qualify.
    pub fn eligible(&self, upid: Upid) -> bool {
        match self.states.get(&upid) {
            None => true,
            Some(s) => s.mmap_dirty || self.iteration >= s.next_eligible,
        }
    }

    pub fn is_dirty(&self, upid: Upid) -> bool {
        self.states.get(&upid).map(|s| s.mmap_dirty).unwrap_or(false)
    }

    /// Mark the UPID dirty: its loaded-library set may have changed.
    pub fn notify_mmap(&mut self, upid: Upid) {
        let state = self.states.entry(upid).or_default();
        state.mmap_dirty = true;
        state.multiplier = 1;
        debug!("mmap notification for {upid}; rescan forced");
    }

    pub fn on_pass(&mut self, upid: Upid, outcome: PassOutcome) {
        let iteration = self.iteration;
        let factor = self.factor;
        let ceiling = self.ceiling;
        let state = self.states.entry(upid).or_default();
        state.mmap_dirty = false;
        match outcome {
            PassOutcome::NewWork => {
                state.multiplier = 1;
                state.next_eligible = iteration + 1;
            }
            PassOutcome::NoNewWork => {
                let scaled = (f64::from(state.multiplier) * factor) as u32;
                state.multiplier = scaled.clamp(1, ceiling);
                state.next_eligible = iteration + u64::from(state.multiplier);
            }
            PassOutcome::TransientFailure => {
                state.next_eligible = iteration + 1;
            }
        }
    }

    pub fn forget(&mut self, upid: Upid) {
        self.states.remove(&upid);
    }

    /// Current backoff multiplier, for observability and tests.
    pub fn multiplier(&self, upid: Upid) -> Option<u32> {
        self.states.get(&upid).map(|s| s.multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upid() -> Upid {
        Upid::new(1, 100, 500)
    }

    #[test]
    fn test_backoff_monotonicity() {
        let mut sched = RescanScheduler::new(2.0, 8);
        let u = upid();
        let mut gaps = Vec::new();
        for _ in 0..20 {
            sched.begin_pass();
            if sched.eligible(u) {
                sched.on_pass(u, PassOutcome::NoNewWork);
                gaps.push(sched.multiplier(u).unwrap());
            }
        }
        // Gap between examined passes doubles until the ceiling.
        assert_eq!(gaps[0], 2);
        for pair in gaps.windows(2) {
            assert!(pair[1] == (pair[0] * 2).min(8));
        }
        assert_eq!(*gaps.last().unwrap(), 8);
    }

    #[test]
    fn test_scenario_backoff_schedule() {
        // Pass 1 examines the UPID and finds nothing; two more passes
        // later the multiplier is 4 (doubled on each *examined* pass).
        let mut sched = RescanScheduler::new(2.0, 1 << 12);
        let u = upid();

        sched.begin_pass(); // iteration 1
        assert!(sched.eligible(u));
        sched.on_pass(u, PassOutcome::NoNewWork);
        assert_eq!(sched.multiplier(u), Some(2));

        sched.begin_pass(); // iteration 2: backed off
        assert!(!sched.eligible(u));

        sched.begin_pass(); // iteration 3: due again
        assert!(sched.eligible(u));
        sched.on_pass(u, PassOutcome::NoNewWork);
        assert_eq!(sched.multiplier(u), Some(4));
    }

    #[test]
    fn test_mmap_dirty_overrides_backoff_and_resets() {
        let mut sched = RescanScheduler::new(2.0, 64);
        let u = upid();

        sched.begin_pass();
        sched.on_pass(u, PassOutcome::NoNewWork);
        sched.begin_pass();
        assert!(!sched.eligible(u));

        sched.notify_mmap(u);
        assert!(sched.eligible(u));
        assert!(sched.is_dirty(u));
        assert_eq!(sched.multiplier(u), Some(1));

        sched.on_pass(u, PassOutcome::NewWork);
        assert!(!sched.is_dirty(u));
        assert_eq!(sched.multiplier(u), Some(1));
    }

    #[test]
    fn test_ceiling_caps_multiplier() {
        let mut sched = RescanScheduler::new(2.0, 8);
        let u = upid();
        for _ in 0..10 {
            sched.begin_pass();
            sched.on_pass(u, PassOutcome::NoNewWork);
        }
        assert_eq!(sched.multiplier(u), Some(8));
    }

    #[test]
    fn test_transient_failure_retries_next_pass() {
        let mut sched = RescanScheduler::new(2.0, 8);
        let u = upid();
        sched.begin_pass();
        sched.on_pass(u, PassOutcome::TransientFailure);
        assert_eq!(sched.multiplier(u), Some(1));
        sched.begin_pass();
        assert!(sched.eligible(u));
    }

    #[test]
    fn test_new_work_resets_backoff() {
        let mut sched = RescanScheduler::new(2.0, 64);
        let u = upid();
        for _ in 0..4 {
            sched.begin_pass();
            if sched.eligible(u) {
                sched.on_pass(u, PassOutcome::NoNewWork);
            }
        }
        assert!(sched.multiplier(u).unwrap() > 1);

        sched.begin_pass();
        sched.on_pass(u, PassOutcome::NewWork);
        assert_eq!(sched.multiplier(u), Some(1));
        sched.begin_pass();
        assert!(sched.eligible(u));
    }

    #[test]
    fn test_forget_drops_state() {
        let mut sched = RescanScheduler::new(2.0, 8);
        let u = upid();
        sched.begin_pass();
        sched.on_pass(u, PassOutcome::NoNewWork);
        sched.forget(u);
        assert_eq!(sched.multiplier(u), None);
        assert!(sched.eligible(u));
    }
}
