use ratatui::{
    backend::CrosstermBackend,
    buffer::{Buffer, Cell},
    layout::Rect,
    style::{Color, Style},
    widgets::Widget,
    Terminal,
};
use std::io::{self, Stdout};

/// Widest panel ever handed out; wide enough for a formatted row plus the
/// right border.
pub const PANEL_WIDTH: u16 = 110;

/// The shared drawing surface. Only the render coordinator holds one.
pub trait Surface: Send + 'static {
    fn size(&self) -> Rect;
    fn set_cell(&mut self, x: u16, y: u16, cell: &Cell);
    fn flush(&mut self) -> io::Result<()>;
}

/// Splits the screen into `count` stacked, equally tall regions. Regions are
/// handed out once at startup and never move.
pub fn partition(area: Rect, count: usize) -> Vec<Rect> {
    if count == 0 {
        return Vec::new();
    }
    let height = area.height / u16::try_from(count).unwrap_or(u16::MAX);
    let width = area.width.min(PANEL_WIDTH);
    (0..count)
        .map(|idx| {
            let offset = u16::try_from(idx).unwrap_or(u16::MAX).saturating_mul(height);
            Rect::new(area.x, area.y.saturating_add(offset), width, height)
        })
        .collect()
}

/// Terminal-backed surface: a persistent screen image that is pushed to the
/// terminal on every flush.
pub struct TerminalSurface {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    screen: Buffer,
}

impl TerminalSurface {
    pub fn new() -> io::Result<Self> {
        let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
        terminal.clear()?;
        let area = terminal.size()?;
        Ok(Self {
            terminal,
            screen: Buffer::empty(area),
        })
    }
}

impl Surface for TerminalSurface {
    fn size(&self) -> Rect {
        self.screen.area
    }

    fn set_cell(&mut self, x: u16, y: u16, cell: &Cell) {
        let area = self.screen.area;
        if x < area.right() && y < area.bottom() {
            *self.screen.get_mut(x, y) = cell.clone();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let screen = &self.screen;
        self.terminal
            .draw(|frame| frame.render_widget(Mirror(screen), frame.size()))?;
        Ok(())
    }
}

struct Mirror<'a>(&'a Buffer);

impl Widget for Mirror<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let shared = self.0.area.intersection(area);
        for y in shared.top()..shared.bottom() {
            for x in shared.left()..shared.right() {
                *buf.get_mut(x, y) = self.0.get(x, y).clone();
            }
        }
    }
}

/// Off-screen drawing area owned by one session, sized like its region.
#[derive(Debug, Clone)]
pub struct Panel {
    buf: Buffer,
}

impl Panel {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            buf: Buffer::empty(Rect::new(0, 0, width, height)),
        }
    }

    pub fn width(&self) -> u16 {
        self.buf.area.width
    }

    pub fn height(&self) -> u16 {
        self.buf.area.height
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.reset();
    }

    /// Fills line `y` with `style` and draws `text` from its left edge.
    pub fn label(&mut self, y: u16, text: &str, style: Style) {
        if y >= self.height() || self.width() == 0 {
            return;
        }
        let width = usize::from(self.width());
        self.buf.set_stringn(0, y, " ".repeat(width), width, style);
        self.buf.set_stringn(0, y, text, width, style);
    }

    pub fn title(&mut self, text: &str) {
        self.label(0, text, Style::default().fg(Color::Black).bg(Color::White));
    }

    /// Clears the middle line and draws `text` roughly centred on it.
    pub fn center(&mut self, text: &str, style: Style) {
        let y = self.height() / 2;
        self.label(y, "", Style::default());
        if y >= self.height() || self.width() == 0 {
            return;
        }
        let len = u16::try_from(text.chars().count()).unwrap_or(u16::MAX);
        let x = (self.width() / 2).saturating_sub(len / 2);
        let room = usize::from(self.width().saturating_sub(x));
        self.buf.set_stringn(x, y, text, room, style);
    }

    /// Bottom `-` rule and right `|` rule.
    pub fn border(&mut self) {
        let (width, height) = (self.width(), self.height());
        if width == 0 || height == 0 {
            return;
        }
        let style = Style::default().fg(Color::Blue);
        self.buf.set_stringn(
            0,
            height - 1,
            "-".repeat(usize::from(width)),
            usize::from(width),
            style,
        );
        for y in 0..height {
            self.buf.get_mut(width - 1, y).set_char('|').set_style(style);
        }
    }

    #[cfg(test)]
    pub fn line_text(&self, y: u16) -> String {
        line_text(&self.buf, y)
    }
}

#[cfg(test)]
pub fn line_text(buf: &Buffer, y: u16) -> String {
    let area = buf.area;
    if y < area.top() || y >= area.bottom() {
        return String::new();
    }
    (area.left()..area.right())
        .map(|x| buf.get(x, y).symbol())
        .collect()
}
