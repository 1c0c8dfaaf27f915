use owo_colors::{OwoColorize, Style, Styled};
use supports_color::Stream::Stderr;

/// Style a value for stderr output, falling back to plain text when the
/// terminal has no colour support.
pub trait StderrStyle {
    fn stderr_style(&self, style: Style) -> Styled<&Self>;
}

impl<D> StderrStyle for D {
    fn stderr_style(&self, style: Style) -> Styled<&Self> {
        self.style(stderr_style_or_plain(style))
    }
}

pub fn stderr_style_or_plain(style: Style) -> Style {
    supports_color::on(Stderr)
        .filter(|f| f.has_basic)
        .map_or_else(Style::new, |_| style)
}
