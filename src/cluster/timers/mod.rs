mod periodic_timer;
mod time;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) use periodic_timer::PeriodicTimerHandle;
pub(crate) use periodic_timer::TimerTick;
