use log::{info, warn};

use crate::{
    error::{DisplayError, DisplayInitError},
    types::TelemetrySample,
};

pub const DISPLAY_LINES: usize = 4;

/// Text-grid operations of the physical panel, in pixel rows.
pub trait TextPanel {
    fn clear(&mut self) -> Result<(), DisplayError>;
    fn clear_band(&mut self, top: u32, height: u32) -> Result<(), DisplayError>;
    fn draw_text(&mut self, text: &str, top: u32) -> Result<(), DisplayError>;
    fn flush(&mut self) -> Result<(), DisplayError>;
}

pub trait PanelFactory {
    type Panel: TextPanel;

    fn init(&mut self) -> Result<Self::Panel, DisplayInitError>;
}

enum PanelSlot<P> {
    Untried,
    Ready(P),
    Unavailable,
}

/// Four addressable text lines over a panel that may not be there.
///
/// The panel is brought up on the first call that needs it. A failed bring-up,
/// or any later draw failure, parks the surface in a silent state for good.
pub struct DisplaySurface<F: PanelFactory> {
    factory: F,
    slot: PanelSlot<F::Panel>,
    line_height: u32,
}

impl<F: PanelFactory> DisplaySurface<F> {
    pub fn new(factory: F, line_height: u32) -> Self {
        Self {
            factory,
            slot: PanelSlot::Untried,
            line_height: line_height.max(1),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.slot, PanelSlot::Ready(_))
    }

    /// Attempts the bring-up if it has not been tried yet.
    pub fn init(&mut self) -> bool {
        if let PanelSlot::Untried = self.slot {
            self.slot = match self.factory.init() {
                Ok(mut panel) => match announce(&mut panel) {
                    Ok(()) => {
                        info!("display initialized");
                        PanelSlot::Ready(panel)
                    }
                    Err(err) => {
                        warn!("display init failed: {err}");
                        PanelSlot::Unavailable
                    }
                },
                Err(err) => {
                    warn!("display init failed: {err}");
                    PanelSlot::Unavailable
                }
            };
        }

        self.is_available()
    }

    pub fn write_line(&mut self, line: usize, text: &str) {
        if line >= DISPLAY_LINES {
            warn!("display line {line} out of range, dropping `{text}`");
            return;
        }

        if !self.init() {
            return;
        }

        let PanelSlot::Ready(panel) = &mut self.slot else {
            return;
        };

        let top = (line as u32).saturating_mul(self.line_height);
        let result = panel
            .clear_band(top, self.line_height)
            .and_then(|()| panel.draw_text(text, top))
            .and_then(|()| panel.flush());

        if let Err(err) = result {
            warn!("display write failed, disabling display: {err}");
            self.slot = PanelSlot::Unavailable;
        }
    }

    pub fn render(&mut self, frame: &DisplayFrame) {
        for (line, text) in frame.lines().iter().enumerate() {
            self.write_line(line, text);
        }
    }
}

fn announce<P: TextPanel>(panel: &mut P) -> Result<(), DisplayError> {
    panel.clear()?;
    panel.draw_text("Display Init OK", 0)?;
    panel.flush()
}

/// Snapshot of all four lines for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    lines: [String; DISPLAY_LINES],
}

impl DisplayFrame {
    pub fn for_tick(sample: &TelemetrySample, fan_on: bool) -> Self {
        Self {
            lines: [
                format!("Temp: {:.1}C", sample.celsius),
                if fan_on { "Fan: ON " } else { "Fan: OFF" }.to_string(),
                "Status:".to_string(),
                "Manual Mode".to_string(),
            ],
        }
    }

    pub fn lines(&self) -> &[String; DISPLAY_LINES] {
        &self.lines
    }
}
