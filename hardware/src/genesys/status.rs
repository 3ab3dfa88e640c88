/// Readback of one supply, parsed from the `STT?` reply.
///
/// Fields are `None` when the reply was missing or malformed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsStatus {
    pub measured_voltage: Option<f64>,
    pub programmed_voltage: Option<f64>,
    pub measured_current: Option<f64>,
    pub programmed_current: Option<f64>,
}

impl PsStatus {
    /// Parse `MV(12.000),PV(12.000),MC(1.500),PC(1.500),SR(30),FR(00)`.
    ///
    /// All four of MV, PV, MC and PC must be present, otherwise the
    /// placeholder status is returned.
    pub fn parse(reply: &str) -> Self {
        let mut status = Self::default();
        for field in reply.split(',') {
            let Some((name, rest)) = field.trim().split_once('(') else {
                continue;
            };
            let Some(value) = rest.strip_suffix(')').and_then(|v| v.trim().parse().ok()) else {
                continue;
            };
            match name {
                "MV" => status.measured_voltage = Some(value),
                "PV" => status.programmed_voltage = Some(value),
                "MC" => status.measured_current = Some(value),
                "PC" => status.programmed_current = Some(value),
                _ => {}
            }
        }

        if status.is_complete() {
            status
        } else {
            Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.measured_voltage.is_some()
            && self.programmed_voltage.is_some()
            && self.measured_current.is_some()
            && self.programmed_current.is_some()
    }
}
