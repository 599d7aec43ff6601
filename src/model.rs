#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub allocated_threads: usize,
    pub idle_threads: usize,
    pub spawned_threads: usize,
    pub spawn_failures: usize,
    pub ready_tasks: usize,
    pub assignments: usize,
}

impl PoolMetrics {
    pub fn busy_threads(&self) -> usize {
        self.allocated_threads.saturating_sub(self.idle_threads)
    }

    pub fn utilization(&self) -> f64 {
        if self.allocated_threads == 0 {
            return 0.0;
        }
        self.busy_threads() as f64 / self.allocated_threads as f64
    }

    /// How often an assignment reused a parked thread instead of spawning one.
    pub fn reuse_rate(&self) -> f64 {
        if self.assignments == 0 {
            return 1.0;
        }
        let reused = self.assignments.saturating_sub(self.spawned_threads);
        reused as f64 / self.assignments as f64
    }
}



#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerMetrics {
    pub scheduled: usize,
    pub fired: usize,
    pub cancelled: usize,
    pub forced: usize,
    pub outstanding: usize,
}

impl TimerMetrics {
    pub fn completed(&self) -> usize {
        self.fired + self.cancelled + self.forced
    }
}


#[derive(Debug, Clone, Default)]
pub struct DispatchMetrics {
    pub enqueued: usize,
    pub rejected: usize,
    pub inline_drains: usize,
    pub pool: Option<PoolMetrics>,
    pub timers: Option<TimerMetrics>,
}

impl DispatchMetrics {
    pub fn is_running(&self) -> bool {
        self.pool.is_some()
    }
}
