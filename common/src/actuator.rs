use crate::error::HardwareError;

pub const DUTY_OFF: u16 = 0;
pub const DUTY_FULL: u16 = u16::MAX;

pub trait PwmOutput {
    fn set_duty_u16(&mut self, duty: u16) -> Result<(), HardwareError>;
}

/// Duty values driven onto the four channels for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorOutputs {
    pub fan: u16,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

impl ActuatorOutputs {
    pub const fn for_fan(fan_on: bool) -> Self {
        if fan_on {
            Self {
                fan: DUTY_FULL,
                red: DUTY_FULL,
                green: DUTY_OFF,
                blue: DUTY_FULL,
            }
        } else {
            Self {
                fan: DUTY_OFF,
                red: DUTY_OFF,
                green: DUTY_FULL,
                blue: DUTY_FULL,
            }
        }
    }
}

/// Fan plus the red/green/blue indicator, all PWM driven.
///
/// Holds no state of its own: every output is recomputed from `fan_on`.
pub struct ActuatorBank<P> {
    fan: P,
    red: P,
    green: P,
    blue: P,
}

impl<P: PwmOutput> ActuatorBank<P> {
    pub fn new(fan: P, red: P, green: P, blue: P) -> Self {
        Self {
            fan,
            red,
            green,
            blue,
        }
    }

    /// Boot pattern: every indicator channel at full duty, fan untouched.
    pub fn neutral(&mut self) -> Result<(), HardwareError> {
        self.red.set_duty_u16(DUTY_FULL)?;
        self.green.set_duty_u16(DUTY_FULL)?;
        self.blue.set_duty_u16(DUTY_FULL)?;
        Ok(())
    }

    pub fn set_fan(&mut self, on: bool) -> Result<(), HardwareError> {
        self.fan.set_duty_u16(ActuatorOutputs::for_fan(on).fan)
    }

    pub fn set_indicator(&mut self, on: bool) -> Result<(), HardwareError> {
        let outputs = ActuatorOutputs::for_fan(on);
        self.red.set_duty_u16(outputs.red)?;
        self.green.set_duty_u16(outputs.green)?;
        // Blue has no meaning in the current indicator scheme and stays at full duty.
        self.blue.set_duty_u16(outputs.blue)?;
        Ok(())
    }

    pub fn apply(&mut self, fan_on: bool) -> Result<ActuatorOutputs, HardwareError> {
        self.set_fan(fan_on)?;
        self.set_indicator(fan_on)?;
        Ok(ActuatorOutputs::for_fan(fan_on))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::RecordingPwm;

    fn bank() -> (ActuatorBank<RecordingPwm>, [RecordingPwm; 4]) {
        let channels = [
            RecordingPwm::default(),
            RecordingPwm::default(),
            RecordingPwm::default(),
            RecordingPwm::default(),
        ];
        let [fan, red, green, blue] = channels.clone();
        (ActuatorBank::new(fan, red, green, blue), channels)
    }

    fn observed(channels: &[RecordingPwm; 4]) -> ActuatorOutputs {
        ActuatorOutputs {
            fan: channels[0].duty().unwrap(),
            red: channels[1].duty().unwrap(),
            green: channels[2].duty().unwrap(),
            blue: channels[3].duty().unwrap(),
        }
    }

    #[test]
    fn fan_on_row() {
        let (mut bank, channels) = bank();

        let outputs = bank.apply(true).unwrap();

        let expected = ActuatorOutputs {
            fan: 65535,
            red: 65535,
            green: 0,
            blue: 65535,
        };
        assert_eq!(outputs, expected);
        assert_eq!(observed(&channels), expected);
    }

    #[test]
    fn fan_off_row() {
        let (mut bank, channels) = bank();

        bank.apply(false).unwrap();

        assert_eq!(
            observed(&channels),
            ActuatorOutputs {
                fan: 0,
                red: 0,
                green: 65535,
                blue: 65535,
            }
        );
    }

    #[test]
    fn outputs_ignore_call_history() {
        let (mut bank, channels) = bank();

        for history in [[true, true, false], [false, true, true], [true, false, false]] {
            for fan_on in history {
                bank.apply(fan_on).unwrap();
            }
            for fan_on in [true, false] {
                bank.apply(fan_on).unwrap();
                assert_eq!(observed(&channels), ActuatorOutputs::for_fan(fan_on));
            }
        }
    }

    #[test]
    fn neutral_leaves_fan_alone() {
        let (mut bank, channels) = bank();

        bank.neutral().unwrap();

        assert_eq!(channels[0].duty(), None);
        for indicator in &channels[1..] {
            assert_eq!(indicator.duty(), Some(DUTY_FULL));
        }
    }

    #[test]
    fn channel_failure_propagates() {
        let (mut bank, channels) = bank();
        channels[2].fail_next("ledc busy");

        let err = bank.apply(true).unwrap_err();

        assert_eq!(err.message(), "ledc busy");
    }
}
