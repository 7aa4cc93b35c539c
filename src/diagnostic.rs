// One-shot diagnostic for a single Dynamixel servo
//
// Fixed linear sequence: connect, ping, limits, torque, LED, goal, settle, read back.
// Connect, ping and torque-on abort the run. Everything else is logged and the run continues.

use std::thread::sleep;
use tracing::{error, info, warn};

use crate::config::{DiagnosticConfig, POSITION_MAX, POSITION_MIN};
use crate::motor::dynamixel::item;
use crate::motor::{model_name, DynamixelError, ServoBus};
use crate::report::{DiagnosticReport, Outcome, Step};

/// Failures that end the run early
#[derive(Debug, thiserror::Error)]
pub enum DiagnosticError {
    #[error("Could not open {device} at {baudrate} baud: {source}")]
    Connect {
        device: String,
        baudrate: u32,
        source: DynamixelError,
    },

    #[error("Ping failed for motor {id}: {source}")]
    Ping { id: u8, source: DynamixelError },

    #[error("Torque on failed for motor {id}: {source}")]
    TorqueOn { id: u8, source: DynamixelError },
}

/// A fatal failure together with the steps that ran before it
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct DiagnosticAbort {
    #[source]
    pub error: DiagnosticError,
    pub report: DiagnosticReport,
}

/// Ticks to degrees (4096 ticks per revolution)
fn ticks_to_degrees(ticks: i32) -> f32 {
    ticks as f32 * 360.0 / 4096.0
}

struct Diagnostic<'a, B> {
    bus: B,
    config: &'a DiagnosticConfig,
    report: DiagnosticReport,
}

impl<B: ServoBus> Diagnostic<'_, B> {
    fn id(&self) -> u8 {
        self.config.id
    }

    /// Non-fatal item read: recorded either way, value only on success
    fn read(&mut self, step: Step, name: &str) -> Option<i32> {
        let id = self.id();
        match self.bus.item_read(id, name) {
            Ok(value) => {
                self.report.record(step, Outcome::Ok { value: Some(value) });
                Some(value)
            }
            Err(e) => {
                warn!("Reading {} failed: {}", name, e);
                self.report.record(step, Outcome::Failed { message: e.to_string() });
                None
            }
        }
    }

    /// Non-fatal write-like step: recorded either way, returns success
    fn attempt(
        &mut self,
        step: Step,
        op: impl FnOnce(&mut B, u8) -> Result<(), DynamixelError>,
    ) -> Result<(), DynamixelError> {
        let id = self.id();
        let result = op(&mut self.bus, id);
        let outcome = match &result {
            Ok(()) => Outcome::Ok { value: None },
            Err(e) => Outcome::Failed { message: e.to_string() },
        };
        self.report.record(step, outcome);
        result
    }

    fn ping(&mut self) -> Result<(), DiagnosticError> {
        let id = self.id();
        match self.bus.ping(id) {
            Ok(model) => {
                info!("PING ok: ID {}, model={} ({})", id, model, model_name(model));
                self.report.model = Some(model);
                self.report.record(Step::Ping, Outcome::Ok { value: Some(model as i32) });
                Ok(())
            }
            Err(source) => {
                error!("PING failed (ID {}): {}", id, source);
                self.report.record(Step::Ping, Outcome::Failed { message: source.to_string() });
                Err(DiagnosticError::Ping { id, source })
            }
        }
    }

    fn check_limits(&mut self) {
        if let Some(min) = self.read(Step::ReadMinLimit, item::MIN_POSITION_LIMIT) {
            info!("Min Position Limit: {}", min);
        }
        if let Some(max) = self.read(Step::ReadMaxLimit, item::MAX_POSITION_LIMIT) {
            info!("Max Position Limit: {}", max);
        }
    }

    fn reset_limits(&mut self) {
        // Limits live in EEPROM, which only accepts writes with torque off
        if let Err(e) = self.attempt(Step::TorqueOff, |bus, id| bus.torque_off(id)) {
            warn!("Torque off failed: {}", e);
        }

        let limits = [
            (Step::WriteMinLimit, item::MIN_POSITION_LIMIT, POSITION_MIN),
            (Step::WriteMaxLimit, item::MAX_POSITION_LIMIT, POSITION_MAX),
        ];
        for (step, name, value) in limits {
            match self.attempt(step, |bus, id| bus.item_write(id, name, value)) {
                Ok(()) => info!("{} -> {}", name, value),
                Err(e) => error!("Setting {} failed: {}", name, e),
            }
        }
    }

    fn torque_on(&mut self) -> Result<(), DiagnosticError> {
        let id = self.id();
        match self.bus.torque_on(id) {
            Ok(()) => {
                info!("Torque on");
                self.report.record(Step::TorqueOn, Outcome::Ok { value: None });
                Ok(())
            }
            Err(source) => {
                error!("Torque on failed: {}", source);
                self.report.record(Step::TorqueOn, Outcome::Failed { message: source.to_string() });
                Err(DiagnosticError::TorqueOn { id, source })
            }
        }
    }

    fn move_to_goal(&mut self) {
        if let Some(pos) = self.read(Step::ReadPosition, item::PRESENT_POSITION) {
            info!("Present position: {} ({:.1}°)", pos, ticks_to_degrees(pos));
        }

        let goal = self.config.goal;
        match self.attempt(Step::GoalPosition, |bus, id| bus.goal_position(id, goal)) {
            Ok(()) => info!("ID {} -> {}: goal position sent", self.id(), goal),
            Err(e) => error!("Goal position failed: {}", e),
        }

        sleep(self.config.settle);

        if let Some(pos) = self.read(Step::ReadSettledPosition, item::PRESENT_POSITION) {
            info!(
                "Position after {:?}: {} (goal: {}, error: {})",
                self.config.settle,
                pos,
                goal,
                pos as i64 - goal as i64
            );
            self.report.final_position = Some(pos);
        }
    }

    fn run_steps(&mut self) -> Result<(), DiagnosticError> {
        self.ping()?;
        self.check_limits();
        self.reset_limits();

        if let Err(e) = self.attempt(Step::LedOn, |bus, id| bus.led_on(id)) {
            error!("LED on failed: {}", e);
        } else {
            info!("LED on");
        }

        self.torque_on()?;
        self.move_to_goal();

        let failed = self.report.failures().count();
        if failed == 0 {
            info!("Diagnostic complete");
        } else {
            warn!("Diagnostic complete with {} failed step(s)", failed);
        }
        Ok(())
    }
}

/// Run the diagnostic against the bus returned by `connect`
///
/// `connect` receives the device path and baudrate from `config`. The
/// returned bus is dropped (closing the port) when the run ends. On a
/// fatal failure the partial report travels with the error.
pub fn run<B, F>(config: &DiagnosticConfig, connect: F) -> Result<DiagnosticReport, DiagnosticAbort>
where
    B: ServoBus,
    F: FnOnce(&str, u32) -> Result<B, DynamixelError>,
{
    let mut report = DiagnosticReport::new(config.id, config.goal);

    info!("Opening Dynamixel bus on {} at {} baud", config.device, config.baudrate);
    let bus = match connect(&config.device, config.baudrate) {
        Ok(bus) => bus,
        Err(source) => {
            error!("Dynamixel init failed: {}", source);
            report.record(Step::Connect, Outcome::Failed { message: source.to_string() });
            let error = DiagnosticError::Connect {
                device: config.device.clone(),
                baudrate: config.baudrate,
                source,
            };
            return Err(DiagnosticAbort { error, report });
        }
    };
    report.record(Step::Connect, Outcome::Ok { value: None });

    let mut diagnostic = Diagnostic { bus, config, report };
    match diagnostic.run_steps() {
        Ok(()) => Ok(diagnostic.report),
        Err(error) => Err(DiagnosticAbort {
            error,
            report: diagnostic.report,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fake bus that logs every call and fails the ones listed in `fail`
    #[derive(Default)]
    struct ScriptedBus {
        calls: Vec<String>,
        fail: HashSet<String>,
        position: i32,
    }

    impl ScriptedBus {
        fn failing(calls: &[&str]) -> Self {
            Self {
                fail: calls.iter().map(|c| c.to_string()).collect(),
                position: 100,
                ..Self::default()
            }
        }

        fn call(&mut self, call: String, id: u8) -> Result<(), DynamixelError> {
            let failed = self.fail.contains(&call);
            self.calls.push(call);
            if failed {
                Err(DynamixelError::Timeout { id })
            } else {
                Ok(())
            }
        }
    }

    impl ServoBus for &mut ScriptedBus {
        fn ping(&mut self, id: u8) -> Result<u16, DynamixelError> {
            self.call("ping".to_string(), id)?;
            Ok(1060)
        }

        fn item_read(&mut self, id: u8, name: &str) -> Result<i32, DynamixelError> {
            self.call(format!("read {}", name), id)?;
            Ok(match name {
                item::MIN_POSITION_LIMIT => 0,
                item::MAX_POSITION_LIMIT => 4095,
                _ => self.position,
            })
        }

        fn item_write(&mut self, id: u8, name: &str, value: i32) -> Result<(), DynamixelError> {
            self.call(format!("write {}={}", name, value), id)?;
            if name == item::GOAL_POSITION {
                self.position = value;
            }
            Ok(())
        }
    }

    /// Captures formatted log output
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> DiagnosticConfig {
        DiagnosticConfig {
            settle: Duration::ZERO,
            ..DiagnosticConfig::default()
        }
    }

    /// Run with a subscriber installed so every log argument is evaluated
    fn run_logged(
        config: &DiagnosticConfig,
        bus: &mut ScriptedBus,
    ) -> (Result<DiagnosticReport, DiagnosticAbort>, String) {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, || run(config, |_, _| Ok(bus)));
        (result, logs.contents())
    }

    fn run_with(bus: &mut ScriptedBus) -> (Result<DiagnosticReport, DiagnosticAbort>, String) {
        run_logged(&test_config(), bus)
    }

    const FULL_SEQUENCE: [&str; 11] = [
        "ping",
        "read Min_Position_Limit",
        "read Max_Position_Limit",
        "write Torque_Enable=0",
        "write Min_Position_Limit=0",
        "write Max_Position_Limit=4095",
        "write LED=1",
        "write Torque_Enable=1",
        "read Present_Position",
        "write Goal_Position=2048",
        "read Present_Position",
    ];

    #[test]
    fn test_full_sequence_in_order() {
        let mut bus = ScriptedBus::failing(&[]);
        let (result, logs) = run_with(&mut bus);
        let report = result.unwrap();

        assert_eq!(bus.calls, FULL_SEQUENCE);
        assert_eq!(report.model, Some(1060));
        assert_eq!(report.final_position, Some(2048));
        assert_eq!(report.failures().count(), 0);

        let steps: Vec<Step> = report.steps.iter().map(|r| r.step).collect();
        assert_eq!(
            steps,
            [
                Step::Connect,
                Step::Ping,
                Step::ReadMinLimit,
                Step::ReadMaxLimit,
                Step::TorqueOff,
                Step::WriteMinLimit,
                Step::WriteMaxLimit,
                Step::LedOn,
                Step::TorqueOn,
                Step::ReadPosition,
                Step::GoalPosition,
                Step::ReadSettledPosition,
            ]
        );

        assert!(logs.contains("PING ok: ID 1, model=1060 (XL430-W250)"));
        assert!(logs.contains("Min_Position_Limit -> 0"));
        assert!(logs.contains("Max_Position_Limit -> 4095"));
        assert!(logs.contains("ID 1 -> 2048: goal position sent"));
        assert!(logs.contains("(goal: 2048, error: 0)"));
        assert!(logs.contains("Diagnostic complete"));
        assert!(!logs.contains("ERROR"));
        assert!(!logs.contains("WARN"));
    }

    #[test]
    fn test_connect_failure_aborts() {
        let mut connected = false;
        let result = run(&test_config(), |device, baudrate| {
            assert_eq!(device, "/dev/ttyUSB0");
            assert_eq!(baudrate, 57_600);
            connected = true;
            Err::<&mut ScriptedBus, _>(DynamixelError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such device",
            )))
        });
        assert!(connected);

        let abort = result.unwrap_err();
        assert!(matches!(abort.error, DiagnosticError::Connect { baudrate: 57_600, .. }));
        assert_eq!(abort.report.steps.len(), 1);
        assert!(matches!(
            abort.report.outcome(Step::Connect),
            Some(Outcome::Failed { .. })
        ));
    }

    #[test]
    fn test_ping_failure_aborts_before_any_register_access() {
        let mut bus = ScriptedBus::failing(&["ping"]);
        let (result, logs) = run_with(&mut bus);

        let abort = result.unwrap_err();
        assert!(matches!(abort.error, DiagnosticError::Ping { id: 1, .. }));
        assert_eq!(bus.calls, ["ping"]);

        // Partial report keeps what ran before the abort
        let steps: Vec<Step> = abort.report.steps.iter().map(|r| r.step).collect();
        assert_eq!(steps, [Step::Connect, Step::Ping]);
        assert_eq!(abort.report.model, None);

        assert!(logs.contains("ERROR"));
        assert!(logs.contains("PING failed (ID 1): Timeout waiting for response from motor 1"));
        assert!(!logs.contains("Diagnostic complete"));
    }

    #[test]
    fn test_torque_on_failure_aborts_before_motion() {
        let mut bus = ScriptedBus::failing(&["write Torque_Enable=1"]);
        let (result, logs) = run_with(&mut bus);

        let abort = result.unwrap_err();
        assert!(matches!(abort.error, DiagnosticError::TorqueOn { id: 1, .. }));
        assert_eq!(bus.calls, FULL_SEQUENCE[..8]);
        assert!(!bus.calls.iter().any(|c| c.starts_with("write Goal_Position")));

        assert_eq!(abort.report.model, Some(1060));
        assert!(matches!(
            abort.report.outcome(Step::TorqueOn),
            Some(Outcome::Failed { .. })
        ));
        assert!(logs.contains("Torque on failed: Timeout waiting for response from motor 1"));
        assert!(!logs.contains("Diagnostic complete"));
    }

    #[test]
    fn test_non_fatal_failures_are_recorded_and_skipped() {
        let mut bus = ScriptedBus::failing(&[
            "read Min_Position_Limit",
            "write Torque_Enable=0",
            "write Max_Position_Limit=4095",
            "write LED=1",
            "write Goal_Position=2048",
        ]);
        let (result, logs) = run_with(&mut bus);
        let report = result.unwrap();

        // Every step still ran
        assert_eq!(bus.calls, FULL_SEQUENCE);
        assert_eq!(report.failures().count(), 5);
        assert_eq!(
            report.outcome(Step::LedOn),
            Some(&Outcome::Failed {
                message: "Timeout waiting for response from motor 1".to_string()
            })
        );
        assert_eq!(
            report.outcome(Step::ReadMaxLimit),
            Some(&Outcome::Ok { value: Some(4095) })
        );
        // Goal never reached the motor, so it stayed where it was
        assert_eq!(report.final_position, Some(100));

        assert!(logs.contains("Reading Min_Position_Limit failed"));
        assert!(logs.contains("Torque off failed"));
        assert!(logs.contains("Setting Max_Position_Limit failed"));
        assert!(logs.contains("LED on failed: Timeout waiting for response from motor 1"));
        assert!(logs.contains("Goal position failed"));
        assert!(logs.contains("Diagnostic complete with 5 failed step(s)"));
    }

    #[test]
    fn test_out_of_range_goal_is_not_sent() {
        let mut bus = ScriptedBus::failing(&[]);
        let config = DiagnosticConfig {
            goal: 5000,
            ..test_config()
        };
        let (result, logs) = run_logged(&config, &mut bus);
        let report = result.unwrap();

        assert!(matches!(
            report.outcome(Step::GoalPosition),
            Some(Outcome::Failed { .. })
        ));
        assert!(!bus.calls.iter().any(|c| c.starts_with("write Goal_Position")));
        assert!(logs.contains("Goal position failed: Value 5000 out of range"));
    }

    #[test]
    fn test_extreme_goal_is_logged_without_overflow() {
        let mut bus = ScriptedBus::failing(&[]);
        let config = DiagnosticConfig {
            goal: i32::MIN,
            ..test_config()
        };
        let (result, logs) = run_logged(&config, &mut bus);
        let report = result.unwrap();

        assert_eq!(report.final_position, Some(100));
        assert!(matches!(
            report.outcome(Step::GoalPosition),
            Some(Outcome::Failed { .. })
        ));
        // 100 - i32::MIN
        assert!(logs.contains("error: 2147483748)"));
    }

    #[test]
    fn test_ticks_to_degrees() {
        assert_eq!(ticks_to_degrees(0), 0.0);
        assert_eq!(ticks_to_degrees(2048), 180.0);
        assert_eq!(ticks_to_degrees(1024), 90.0);
    }
}
