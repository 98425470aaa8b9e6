//! Heater standby management.
//!
//! Each heater carries two one-shot countdown timers: active→standby and
//! standby→powerdown. Timers are deadlines checked by [`HeaterBank::tick`]
//! on the single control thread; a configured duration of zero disables a
//! timer entirely. Heaters are created lazily on first binding reference and
//! shared by name, so several tools can drive the same physical heater.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use toolmux_common::{HeaterBinding, HeaterPowerState, ToolmuxError, MIN_TIMER_DELAY};

use crate::traits::{HeaterOutput, Telemetry};

/// One-shot countdown timer with a reconfigurable duration.
///
/// A duration of zero disables the timer: it never fires. Setting the timer
/// while it is counting down reschedules it from `now` with the new
/// duration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StandbyTimer {
    duration: f64,
    deadline: Option<f64>,
}

impl StandbyTimer {
    /// Arm the timer with the given duration. Zero disables it.
    pub fn set(&mut self, duration: f64, now: f64) {
        self.duration = duration;
        self.deadline = if duration == 0.0 {
            None
        } else {
            Some(now + duration.max(MIN_TIMER_DELAY))
        };
    }

    /// Update the configured duration; if the timer is counting down it is
    /// rescheduled from `now` immediately.
    pub fn reconfigure(&mut self, duration: f64, now: f64) {
        if self.counting_down() {
            self.set(duration, now);
        } else {
            self.duration = duration;
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn counting_down(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn deadline(&self) -> Option<f64> {
        self.deadline
    }

    fn take_if_fired(&mut self, now: f64) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// A shared heater instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Heater {
    name: String,
    state: HeaterPowerState,
    active_to_standby: StandbyTimer,
    standby_to_powerdown: StandbyTimer,
    /// Temperature to command when the active→standby timer fires.
    pending_standby_temp: f64,
    /// Topmost tool the current activity is attributed to.
    attributed_tool: Option<String>,
}

impl Heater {
    pub fn state(&self) -> HeaterPowerState {
        self.state
    }

    pub fn active_to_standby(&self) -> &StandbyTimer {
        &self.active_to_standby
    }

    pub fn standby_to_powerdown(&self) -> &StandbyTimer {
        &self.standby_to_powerdown
    }
}

/// Everything a single heater transition needs to know about the acting
/// tool. Built by the coordinator from the tool's binding and runtime temps;
/// the binding's temperature offset is already applied to both temps.
#[derive(Debug, Clone)]
pub struct HeaterRequest<'a> {
    pub tool: &'a str,
    /// Topmost ancestor sharing the binding; receives the statistics.
    pub attributed_tool: &'a str,
    pub binding: &'a HeaterBinding,
    pub active_temp: f64,
    pub standby_temp: f64,
    pub active_to_standby_delay: f64,
    pub standby_to_powerdown_delay: f64,
}

/// All heaters, keyed by name.
#[derive(Debug, Default)]
pub struct HeaterBank {
    heaters: BTreeMap<String, Heater>,
}

impl HeaterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the heater on first reference; later references share it.
    pub fn ensure(&mut self, name: &str) -> &mut Heater {
        self.heaters.entry(name.to_string()).or_insert_with(|| {
            debug!(heater = name, "registered heater");
            Heater {
                name: name.to_string(),
                ..Heater::default()
            }
        })
    }

    pub fn heater(&self, name: &str) -> Option<&Heater> {
        self.heaters.get(name)
    }

    /// Transitions one heater on behalf of a tool.
    pub fn transition(
        &mut self,
        req: &HeaterRequest<'_>,
        target: HeaterPowerState,
        now: f64,
        out: &mut dyn HeaterOutput,
        stats: &mut dyn Telemetry,
    ) -> Result<(), ToolmuxError> {
        let heater = self
            .heaters
            .get_mut(&req.binding.heater)
            .ok_or_else(|| ToolmuxError::UnknownHeater(req.binding.heater.clone()))?;

        if heater.state == target {
            // Same-state transitions just re-command the matching temperature.
            match target {
                HeaterPowerState::Active => out.set_target(&heater.name, req.active_temp),
                HeaterPowerState::Standby => out.set_target(&heater.name, req.standby_temp),
                HeaterPowerState::Off => {}
            }
            return Ok(());
        }

        match target {
            HeaterPowerState::Active => {
                heater.active_to_standby.cancel();
                heater.standby_to_powerdown.cancel();
                out.set_target(&heater.name, req.active_temp);
                stats.heater_standby_end(req.attributed_tool);
                stats.heater_active_start(req.attributed_tool);
                info!(heater = %heater.name, tool = req.tool, "heater active");
            }
            HeaterPowerState::Standby => {
                let measured = out.measured_temp(&heater.name);
                if heater.state == HeaterPowerState::Active && req.standby_temp < measured {
                    heater.active_to_standby.set(req.active_to_standby_delay, now);
                    heater
                        .standby_to_powerdown
                        .set(req.standby_to_powerdown_delay, now);
                } else {
                    // Already at or below standby temperature: drop to
                    // standby promptly instead of waiting the full delay.
                    heater.active_to_standby.set(MIN_TIMER_DELAY, now);
                    heater
                        .standby_to_powerdown
                        .set(req.standby_to_powerdown_delay, now);
                }
                heater.pending_standby_temp = req.standby_temp;
                stats.heater_active_end(req.attributed_tool);
                stats.heater_standby_start(req.attributed_tool);
                info!(
                    heater = %heater.name,
                    tool = req.tool,
                    standby_in = heater.active_to_standby.duration(),
                    powerdown_in = heater.standby_to_powerdown.duration(),
                    "heater standby"
                );
            }
            HeaterPowerState::Off => {
                heater.active_to_standby.set(0.0, now);
                heater.standby_to_powerdown.set(MIN_TIMER_DELAY, now);
                info!(heater = %heater.name, tool = req.tool, "heater powering down");
            }
        }
        heater.state = target;
        heater.attributed_tool = Some(req.attributed_tool.to_string());
        Ok(())
    }

    /// Reconfigure a heater's timer durations. Timers already counting down
    /// restart at the new duration immediately.
    pub fn reconfigure_delays(
        &mut self,
        name: &str,
        active_to_standby: Option<f64>,
        standby_to_powerdown: Option<f64>,
        now: f64,
    ) -> Result<(), ToolmuxError> {
        let heater = self
            .heaters
            .get_mut(name)
            .ok_or_else(|| ToolmuxError::UnknownHeater(name.to_string()))?;
        if let Some(duration) = active_to_standby {
            heater.active_to_standby.reconfigure(duration, now);
        }
        if let Some(duration) = standby_to_powerdown {
            heater.standby_to_powerdown.reconfigure(duration, now);
        }
        Ok(())
    }

    /// Fires any expired timers. Called from the host event loop; timer
    /// effects are temperature commands only and are independent of tool
    /// state mutation.
    pub fn tick(&mut self, now: f64, out: &mut dyn HeaterOutput, stats: &mut dyn Telemetry) {
        for heater in self.heaters.values_mut() {
            if heater.active_to_standby.take_if_fired(now) {
                out.set_target(&heater.name, heater.pending_standby_temp);
                info!(
                    heater = %heater.name,
                    temp = heater.pending_standby_temp,
                    "standby delay elapsed, dropping to standby temperature"
                );
            }
            if heater.standby_to_powerdown.take_if_fired(now) {
                out.set_target(&heater.name, 0.0);
                heater.state = HeaterPowerState::Off;
                if let Some(tool) = heater.attributed_tool.as_deref() {
                    stats.heater_standby_end(tool);
                    stats.heater_powerdown(tool);
                }
                info!(heater = %heater.name, "powerdown delay elapsed, heater off");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NullTelemetry;

    #[derive(Default)]
    struct FakeOutput {
        targets: Vec<(String, f64)>,
        measured: f64,
    }

    impl HeaterOutput for FakeOutput {
        fn set_target(&mut self, heater: &str, temp: f64) {
            self.targets.push((heater.to_string(), temp));
        }

        fn measured_temp(&self, _heater: &str) -> f64 {
            self.measured
        }
    }

    fn request<'a>(binding: &'a HeaterBinding) -> HeaterRequest<'a> {
        HeaterRequest {
            tool: "t0",
            attributed_tool: "t0",
            binding,
            active_temp: 210.0,
            standby_temp: 40.0,
            active_to_standby_delay: 5.0,
            standby_to_powerdown_delay: 300.0,
        }
    }

    #[test]
    fn active_cancels_timers_and_sets_temp() {
        let binding = HeaterBinding::parse("t0", "extruder").unwrap();
        let mut bank = HeaterBank::new();
        bank.ensure("extruder");
        let mut out = FakeOutput { measured: 20.0, ..FakeOutput::default() };
        let mut stats = NullTelemetry;

        bank.transition(&request(&binding), HeaterPowerState::Active, 0.0, &mut out, &mut stats)
            .unwrap();
        let heater = bank.heater("extruder").unwrap();
        assert_eq!(heater.state(), HeaterPowerState::Active);
        assert!(!heater.active_to_standby().counting_down());
        assert!(!heater.standby_to_powerdown().counting_down());
        assert_eq!(out.targets, vec![("extruder".to_string(), 210.0)]);
    }

    #[test]
    fn standby_from_hot_active_starts_both_timers() {
        let binding = HeaterBinding::parse("t0", "extruder").unwrap();
        let mut bank = HeaterBank::new();
        bank.ensure("extruder");
        let mut out = FakeOutput { measured: 210.0, ..FakeOutput::default() };
        let mut stats = NullTelemetry;

        bank.transition(&request(&binding), HeaterPowerState::Active, 0.0, &mut out, &mut stats)
            .unwrap();
        bank.transition(&request(&binding), HeaterPowerState::Standby, 10.0, &mut out, &mut stats)
            .unwrap();

        let heater = bank.heater("extruder").unwrap();
        assert_eq!(heater.state(), HeaterPowerState::Standby);
        assert_eq!(heater.active_to_standby().deadline(), Some(15.0));
        assert_eq!(heater.standby_to_powerdown().deadline(), Some(310.0));

        // Temperature only drops once the timer fires.
        out.targets.clear();
        bank.tick(14.9, &mut out, &mut stats);
        assert!(out.targets.is_empty());
        bank.tick(15.0, &mut out, &mut stats);
        assert_eq!(out.targets, vec![("extruder".to_string(), 40.0)]);
    }

    #[test]
    fn standby_when_already_cool_is_prompt() {
        let binding = HeaterBinding::parse("t0", "extruder").unwrap();
        let mut bank = HeaterBank::new();
        bank.ensure("extruder");
        let mut out = FakeOutput { measured: 35.0, ..FakeOutput::default() };
        let mut stats = NullTelemetry;

        bank.transition(&request(&binding), HeaterPowerState::Active, 0.0, &mut out, &mut stats)
            .unwrap();
        bank.transition(&request(&binding), HeaterPowerState::Standby, 10.0, &mut out, &mut stats)
            .unwrap();

        let heater = bank.heater("extruder").unwrap();
        // Minimal delay, not disabled.
        assert_eq!(heater.active_to_standby().deadline(), Some(10.0 + MIN_TIMER_DELAY));
        assert_eq!(heater.standby_to_powerdown().deadline(), Some(310.0));
    }

    #[test]
    fn off_disables_standby_timer_and_schedules_prompt_powerdown() {
        let binding = HeaterBinding::parse("t0", "extruder").unwrap();
        let mut bank = HeaterBank::new();
        bank.ensure("extruder");
        let mut out = FakeOutput { measured: 210.0, ..FakeOutput::default() };
        let mut stats = NullTelemetry;

        bank.transition(&request(&binding), HeaterPowerState::Active, 0.0, &mut out, &mut stats)
            .unwrap();
        bank.transition(&request(&binding), HeaterPowerState::Standby, 5.0, &mut out, &mut stats)
            .unwrap();
        bank.transition(&request(&binding), HeaterPowerState::Off, 6.0, &mut out, &mut stats)
            .unwrap();

        let heater = bank.heater("extruder").unwrap();
        assert_eq!(heater.state(), HeaterPowerState::Off);
        assert!(!heater.active_to_standby().counting_down());
        assert_eq!(heater.active_to_standby().duration(), 0.0);
        assert_eq!(heater.standby_to_powerdown().deadline(), Some(6.0 + MIN_TIMER_DELAY));

        out.targets.clear();
        bank.tick(6.0 + MIN_TIMER_DELAY, &mut out, &mut stats);
        assert_eq!(out.targets, vec![("extruder".to_string(), 0.0)]);
    }

    #[test]
    fn reconfigure_while_counting_down_restarts_timer() {
        let binding = HeaterBinding::parse("t0", "extruder").unwrap();
        let mut bank = HeaterBank::new();
        bank.ensure("extruder");
        let mut out = FakeOutput { measured: 210.0, ..FakeOutput::default() };
        let mut stats = NullTelemetry;

        bank.transition(&request(&binding), HeaterPowerState::Active, 0.0, &mut out, &mut stats)
            .unwrap();
        bank.transition(&request(&binding), HeaterPowerState::Standby, 0.0, &mut out, &mut stats)
            .unwrap();
        assert_eq!(
            bank.heater("extruder").unwrap().standby_to_powerdown().deadline(),
            Some(300.0)
        );

        bank.reconfigure_delays("extruder", None, Some(60.0), 10.0).unwrap();
        assert_eq!(
            bank.heater("extruder").unwrap().standby_to_powerdown().deadline(),
            Some(70.0)
        );

        // Reconfiguring an idle timer only changes the stored duration.
        bank.reconfigure_delays("extruder", Some(9.0), None, 10.0).unwrap();
        let heater = bank.heater("extruder").unwrap();
        assert_eq!(heater.active_to_standby().duration(), 9.0);
    }

    #[test]
    fn zero_duration_disables_timer() {
        let mut timer = StandbyTimer::default();
        timer.set(0.0, 5.0);
        assert!(!timer.counting_down());
        timer.set(2.0, 5.0);
        assert_eq!(timer.deadline(), Some(7.0));
    }
}
