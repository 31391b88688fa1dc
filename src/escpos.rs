//! Minimal ESC/POS binary command builder for thermal receipt printers.
//!
//! Generates raw byte sequences sent straight to a network printer. Text is
//! encoded as CP858 (Western European with the euro sign), which covers
//! Spanish accents, `ñ`, `¿`, `¡` and `º`.

// ESC/POS command bytes
const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;
const LF: u8 = 0x0A;

/// `ESC t` table number of PC858 on Epson-compatible printers.
const CODE_PAGE_PC858: u8 = 19;

/// Paper width in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperWidth {
    Mm58,
    Mm80,
}

impl PaperWidth {
    pub fn chars(self) -> usize {
        match self {
            PaperWidth::Mm58 => 32,
            PaperWidth::Mm80 => 48,
        }
    }

    pub fn from_mm(mm: u16) -> Self {
        if mm <= 58 {
            PaperWidth::Mm58
        } else {
            PaperWidth::Mm80
        }
    }
}

/// Builder for generating ESC/POS binary command buffers.
///
/// ```rust,ignore
/// let mut b = EscPosBuilder::new();
/// b.init()
///     .spanish()
///     .center()
///     .bold(true).text("BUFFET\n").bold(false)
///     .left()
///     .line_pair("Choripán", "$ 1.500,00")
///     .feed(3)
///     .cut();
/// let data = b.build();
/// ```
pub struct EscPosBuilder {
    buffer: Vec<u8>,
    paper: PaperWidth,
}

impl Default for EscPosBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EscPosBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
            paper: PaperWidth::Mm80,
        }
    }

    pub fn with_paper(mut self, paper: PaperWidth) -> Self {
        self.paper = paper;
        self
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// ESC @: Initialize printer, reset to defaults.
    pub fn init(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x40]);
        self
    }

    /// ESC t n: Select character code page.
    pub fn code_page(&mut self, page: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x74, page]);
        self
    }

    /// Select PC858 so [`text`](Self::text) output prints accents correctly.
    pub fn spanish(&mut self) -> &mut Self {
        self.code_page(CODE_PAGE_PC858)
    }

    // -----------------------------------------------------------------------
    // Text formatting
    // -----------------------------------------------------------------------

    /// ESC E n: Bold on/off.
    pub fn bold(&mut self, on: bool) -> &mut Self {
        self.buffer
            .extend_from_slice(&[ESC, 0x45, if on { 1 } else { 0 }]);
        self
    }

    /// GS ! n: Set text size (width × height multiplier, 1–8 each).
    pub fn text_size(&mut self, width: u8, height: u8) -> &mut Self {
        let w = width.clamp(1, 8) - 1;
        let h = height.clamp(1, 8) - 1;
        self.buffer.extend_from_slice(&[GS, 0x21, (w << 4) | h]);
        self
    }

    /// Reset text size to 1×1.
    pub fn normal_size(&mut self) -> &mut Self {
        self.text_size(1, 1)
    }

    // -----------------------------------------------------------------------
    // Alignment
    // -----------------------------------------------------------------------

    /// ESC a 0: Left-align.
    pub fn left(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x61, 0]);
        self
    }

    /// ESC a 1: Centre-align.
    pub fn center(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x61, 1]);
        self
    }

    // -----------------------------------------------------------------------
    // Text output
    // -----------------------------------------------------------------------

    /// Append text encoded as CP858.
    pub fn text(&mut self, s: &str) -> &mut Self {
        self.buffer.extend(encode_cp858(s));
        self
    }

    /// Append a line-feed.
    pub fn lf(&mut self) -> &mut Self {
        self.buffer.push(LF);
        self
    }

    /// Print a horizontal separator using dashes, matching paper width.
    pub fn separator(&mut self) -> &mut Self {
        let width = self.paper.chars();
        self.buffer.extend(std::iter::repeat(b'-').take(width));
        self.buffer.push(LF);
        self
    }

    /// Print a line with left-aligned label and right-aligned value.
    pub fn line_pair(&mut self, label: &str, value: &str) -> &mut Self {
        let width = self.paper.chars();
        let used = label.chars().count() + value.chars().count();
        let gap = width.saturating_sub(used).max(1);
        self.text(label);
        self.buffer.extend(std::iter::repeat(b' ').take(gap));
        self.text(value);
        self.lf()
    }

    // -----------------------------------------------------------------------
    // Feed / cut
    // -----------------------------------------------------------------------

    /// ESC d n: Feed n lines.
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x64, lines]);
        self
    }

    /// GS V A 16: Partial cut with 16-dot feed.
    pub fn cut(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[GS, 0x56, 0x41, 0x10]);
        self
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Consume the builder and return the binary ESC/POS payload.
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// CP858 encoding
// ---------------------------------------------------------------------------

/// Encode a string to CP858 bytes. ASCII passes through; unknown characters
/// become `?`.
pub fn encode_cp858(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| {
            let code = ch as u32;
            if code < 0x80 {
                code as u8
            } else {
                latin_to_cp858(ch).unwrap_or(b'?')
            }
        })
        .collect()
}

fn latin_to_cp858(ch: char) -> Option<u8> {
    match ch {
        'á' => Some(0xA0),
        'é' => Some(0x82),
        'í' => Some(0xA1),
        'ó' => Some(0xA2),
        'ú' => Some(0xA3),
        'ñ' => Some(0xA4),
        'Ñ' => Some(0xA5),
        'ü' => Some(0x81),
        'Ü' => Some(0x9A),
        'Á' => Some(0xB5),
        'É' => Some(0x90),
        'Í' => Some(0xD6),
        'Ó' => Some(0xE0),
        'Ú' => Some(0xE9),
        'ª' => Some(0xA6),
        'º' => Some(0xA7),
        '¿' => Some(0xA8),
        '¡' => Some(0xAD),
        '°' => Some(0xF8),
        '€' => Some(0xD5),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_code_page() {
        let data = {
            let mut b = EscPosBuilder::new();
            b.init().spanish();
            b.build()
        };
        assert_eq!(data, vec![0x1B, 0x40, 0x1B, 0x74, 19]);
    }

    #[test]
    fn test_bold_on_off() {
        let data = {
            let mut b = EscPosBuilder::new();
            b.bold(true).text("HI").bold(false);
            b.build()
        };
        assert_eq!(data, vec![0x1B, 0x45, 1, b'H', b'I', 0x1B, 0x45, 0]);
    }

    #[test]
    fn test_spanish_encoding() {
        assert_eq!(encode_cp858("Nº"), vec![b'N', 0xA7]);
        assert_eq!(encode_cp858("Año"), vec![b'A', 0xA4, b'o']);
        assert_eq!(encode_cp858("¿Sí?"), vec![0xA8, b'S', 0xA1, b'?']);
        assert_eq!(encode_cp858("日"), vec![b'?']);
    }

    #[test]
    fn test_separator_58mm() {
        let data = {
            let mut b = EscPosBuilder::new().with_paper(PaperWidth::Mm58);
            b.separator();
            b.build()
        };
        assert_eq!(data.len(), 33);
        assert!(data[..32].iter().all(|&b| b == b'-'));
        assert_eq!(data[32], 0x0A);
    }

    #[test]
    fn test_line_pair_counts_characters_not_bytes() {
        let data = {
            let mut b = EscPosBuilder::new().with_paper(PaperWidth::Mm58);
            b.line_pair("Choripán", "$ 1.500,00");
            b.build()
        };
        // 32 printed columns + LF, one byte per column in CP858
        assert_eq!(data.len(), 33);
        assert_eq!(data[6], 0xA0);
        assert_eq!(&data[22..32], b"$ 1.500,00");
    }

    #[test]
    fn test_text_size_and_cut() {
        let data = {
            let mut b = EscPosBuilder::new();
            b.text_size(2, 2).normal_size().feed(3).cut();
            b.build()
        };
        assert_eq!(
            data,
            vec![0x1D, 0x21, 0x11, 0x1D, 0x21, 0x00, 0x1B, 0x64, 3, 0x1D, 0x56, 0x41, 0x10]
        );
    }

    #[test]
    fn test_paper_from_mm() {
        assert_eq!(PaperWidth::from_mm(58), PaperWidth::Mm58);
        assert_eq!(PaperWidth::from_mm(80), PaperWidth::Mm80);
        assert_eq!(PaperWidth::Mm80.chars(), 48);
    }
}
