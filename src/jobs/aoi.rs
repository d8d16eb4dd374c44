//! AOI geometry parsing.
//!
//! Pure functions consumed by request validation: a WKT subset
//! (POLYGON / MULTIPOLYGON) and the matching GeoJSON geometries. Rings must
//! be closed and carry at least four positions.

use serde_json::Value;
use thiserror::Error;

pub type Position = (f64, f64);
pub type Ring = Vec<Position>;

#[derive(Debug, Clone, PartialEq)]
pub enum AoiGeometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl AoiGeometry {
    /// Total number of exterior rings, mostly useful in logs.
    pub fn polygon_count(&self) -> usize {
        match self {
            AoiGeometry::Polygon(_) => 1,
            AoiGeometry::MultiPolygon(polygons) => polygons.len(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AoiError {
    #[error("empty geometry")]
    Empty,
    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometry(String),
    #[error("syntax error at byte {0}")]
    Syntax(usize),
    #[error("invalid coordinate: {0}")]
    InvalidNumber(String),
    #[error("ring must contain at least 4 positions")]
    RingTooShort,
    #[error("ring is not closed")]
    OpenRing,
}

/// Parse a WKT `POLYGON` or `MULTIPOLYGON` string.
pub fn parse_wkt(input: &str) -> Result<AoiGeometry, AoiError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AoiError::Empty);
    }

    let open = trimmed.find('(').ok_or(AoiError::Syntax(trimmed.len()))?;
    let keyword = trimmed[..open].trim().to_ascii_uppercase();
    let mut cursor = Cursor::new(trimmed, open);

    let geometry = match keyword.as_str() {
        "POLYGON" => AoiGeometry::Polygon(cursor.parse_polygon()?),
        "MULTIPOLYGON" => {
            cursor.expect(b'(')?;
            let mut polygons = Vec::new();
            loop {
                polygons.push(cursor.parse_polygon()?);
                if !cursor.consume(b',') {
                    cursor.expect(b')')?;
                    break;
                }
            }
            AoiGeometry::MultiPolygon(polygons)
        }
        other => return Err(AoiError::UnsupportedGeometry(other.to_string())),
    };

    cursor.skip_ws();
    if !cursor.at_end() {
        return Err(AoiError::Syntax(cursor.pos));
    }

    validate(&geometry)?;
    Ok(geometry)
}

/// Parse a GeoJSON geometry object (`Polygon` or `MultiPolygon`).
pub fn parse_geojson(value: &Value) -> Result<AoiGeometry, AoiError> {
    let object = value.as_object().ok_or(AoiError::Empty)?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(AoiError::Empty)?;
    let coordinates = object.get("coordinates").ok_or(AoiError::Empty)?;

    let geometry = match kind {
        "Polygon" => AoiGeometry::Polygon(json_rings(coordinates)?),
        "MultiPolygon" => {
            let polygons = coordinates
                .as_array()
                .ok_or_else(|| AoiError::InvalidNumber("coordinates".into()))?
                .iter()
                .map(json_rings)
                .collect::<Result<Vec<_>, _>>()?;
            if polygons.is_empty() {
                return Err(AoiError::Empty);
            }
            AoiGeometry::MultiPolygon(polygons)
        }
        other => return Err(AoiError::UnsupportedGeometry(other.to_string())),
    };

    validate(&geometry)?;
    Ok(geometry)
}

fn json_rings(value: &Value) -> Result<Vec<Ring>, AoiError> {
    let rings = value
        .as_array()
        .ok_or_else(|| AoiError::InvalidNumber("coordinates".into()))?
        .iter()
        .map(json_ring)
        .collect::<Result<Vec<_>, _>>()?;
    if rings.is_empty() {
        return Err(AoiError::Empty);
    }
    Ok(rings)
}

fn json_ring(value: &Value) -> Result<Ring, AoiError> {
    value
        .as_array()
        .ok_or_else(|| AoiError::InvalidNumber("ring".into()))?
        .iter()
        .map(|position| {
            let parts = position
                .as_array()
                .ok_or_else(|| AoiError::InvalidNumber("position".into()))?;
            if parts.len() < 2 {
                return Err(AoiError::InvalidNumber("position".into()));
            }
            let x = parts[0]
                .as_f64()
                .ok_or_else(|| AoiError::InvalidNumber(parts[0].to_string()))?;
            let y = parts[1]
                .as_f64()
                .ok_or_else(|| AoiError::InvalidNumber(parts[1].to_string()))?;
            Ok((x, y))
        })
        .collect()
}

fn validate(geometry: &AoiGeometry) -> Result<(), AoiError> {
    let polygons: Vec<&Vec<Ring>> = match geometry {
        AoiGeometry::Polygon(rings) => vec![rings],
        AoiGeometry::MultiPolygon(polygons) => polygons.iter().collect(),
    };
    for rings in polygons {
        if rings.is_empty() {
            return Err(AoiError::Empty);
        }
        for ring in rings {
            if ring.len() < 4 {
                return Err(AoiError::RingTooShort);
            }
            if ring.first() != ring.last() {
                return Err(AoiError::OpenRing);
            }
        }
    }
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str, pos: usize) -> Self {
        Self { bytes: input.as_bytes(), pos }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), AoiError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(AoiError::Syntax(self.pos))
        }
    }

    fn consume(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_polygon(&mut self) -> Result<Vec<Ring>, AoiError> {
        self.expect(b'(')?;
        let mut rings = Vec::new();
        loop {
            rings.push(self.parse_ring()?);
            if !self.consume(b',') {
                self.expect(b')')?;
                break;
            }
        }
        Ok(rings)
    }

    fn parse_ring(&mut self) -> Result<Ring, AoiError> {
        self.expect(b'(')?;
        let mut ring = Vec::new();
        loop {
            let x = self.parse_number()?;
            let y = self.parse_number()?;
            ring.push((x, y));
            if !self.consume(b',') {
                self.expect(b')')?;
                break;
            }
        }
        Ok(ring)
    }

    fn parse_number(&mut self) -> Result<f64, AoiError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E' => self.pos += 1,
                _ => break,
            }
        }
        if start == self.pos {
            return Err(AoiError::Syntax(self.pos));
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| AoiError::Syntax(start))?;
        text.parse::<f64>()
            .map_err(|_| AoiError::InvalidNumber(text.to_string()))
    }
}
