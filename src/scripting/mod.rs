//! Automation hook scripting.
//!
//! Hooks are Rhai scripts defining `initSchedule()` and `onSchedule()`. They are compiled
//! by a sandboxed [`HookEngine`] and handed to the scheduler as [`RhaiHooks`], which
//! implement [`ScheduleHooks`](crate::automation::ScheduleHooks).
//!
//! ```text
//! HookEngine::with_station(limits, bindings)
//!     └── compile(script) -> RhaiHooks ──> Automation::start(Arc<RhaiHooks>)
//!
//! Station bindings (bindings.rs)
//!     └── instrument(), motor(), relay(), apply(), sleep(), save_trace()
//! ```

pub mod bindings;
pub mod rhai_engine;

pub use bindings::{register_station, StationBindings};
pub use rhai_engine::{HookEngine, HookLimits, RhaiHooks, INIT_HOOK, SCHEDULE_HOOK};

/// Template loaded when no hook script is configured
pub const DEFAULT_HOOKS: &str = r#"// Called once when the automation scheduler starts
fn initSchedule() {
}

// Called every time a scheduled job runs
fn onSchedule() {
}
"#;

/// Ready-made hook scripts, by name
pub const PRESETS: &[(&str, &str)] = &[
    ("default", DEFAULT_HOOKS),
    (
        "clear-write",
        r#"// Save one clear/write trace per scheduled time
fn initSchedule() {
    apply(#{ tracetype: "WRIT" });
}

fn onSchedule() {
    instrument().restart_sweep();
    sleep(parse_float(instrument().param("sweeptime")) + 1.0);
    save_trace();
}
"#,
    ),
    (
        "max-hold",
        r#"// Hold the maximum over the configured count, then save
fn initSchedule() {
    apply(#{ tracetype: "MAXH", avgcount: 100 });
}

fn onSchedule() {
    instrument().restart_sweep();
    sleep(parse_float(instrument().param("sweeptime")) * 100.0 + 1.0);
    save_trace();
}
"#,
    ),
    (
        "average",
        r#"// Average over the configured count, then save
fn initSchedule() {
    apply(#{ tracetype: "AVER", avgtype: "LOG", avgcount: 100 });
}

fn onSchedule() {
    instrument().restart_sweep();
    sleep(parse_float(instrument().param("sweeptime")) * 100.0 + 1.0);
    save_trace();
}
"#,
    ),
];

/// Preset script by name
pub fn preset(name: &str) -> Option<&'static str> {
    PRESETS
        .iter()
        .find(|(preset, _)| preset.eq_ignore_ascii_case(name))
        .map(|(_, script)| *script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_compile() {
        let engine = HookEngine::new(HookLimits::default());
        for (name, script) in PRESETS {
            assert!(engine.compile(script).is_ok(), "preset {name} failed to compile");
        }
    }

    #[test]
    fn test_preset_lookup() {
        assert_eq!(preset("DEFAULT"), Some(DEFAULT_HOOKS));
        assert!(preset("missing").is_none());
    }
}
