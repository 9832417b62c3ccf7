//! The logical field catalogue: which fields exist, what they represent and
//! which statistical model they follow.

use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use std::fmt;

/// Statistical model of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Distribution {
    /// Shifted lognormal density fields: `log(x + shift)` is Gaussian.
    Lognormal,
    /// Plain Gaussian fields.
    Gaussian,
    /// No randomness at all; maps are filled with the target means.
    Homogeneous,
}

/// What a field physically represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    /// A galaxy number-density contrast slice.
    Density,
    /// A weak-lensing convergence slice.
    Convergence,
}

impl FieldKind {
    /// Decodes the numeric kind column of a FIELDS_INFO record.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Density),
            2 => Some(Self::Convergence),
            _ => None,
        }
    }

    /// The numeric code used by the FIELDS_INFO format.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Density => 1,
            Self::Convergence => 2,
        }
    }
}

/// The (f, z) identifier of a field.
///
/// `f` distinguishes physical fields, `z` counts redshift slices within one
/// physical field.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FieldName {
    /// Physical field number.
    pub f: u32,
    /// Redshift slice number.
    pub z: u32,
}

impl fmt::Display for FieldName {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "f{}z{}", self.f, self.z)
    }
}

/// Metadata of a single field.
#[derive(Clone, Debug)]
pub struct Field {
    /// The (f, z) identifier.
    pub name: FieldName,
    /// Density or convergence.
    pub kind: FieldKind,
    /// Target mean of the realised map.
    pub mean: f64,
    /// Lognormal shift; the realised pixel values stay above `-shift`.
    pub shift: f64,
    /// Lower edge of the redshift window.
    pub zmin: f64,
    /// Upper edge of the redshift window.
    pub zmax: f64,
}

impl Field {
    /// Midpoint of the redshift window.
    #[must_use]
    pub fn z_mid(&self) -> f64 {
        0.5 * (self.zmin + self.zmax)
    }
}

/// Immutable, ordered catalogue of the fields of a run.
///
/// The registry owns the index ↔ (f, z) bijection and remembers the order in
/// which spectrum pairs appeared in the input, so outputs can reproduce it.
/// It is constructed once and shared by reference; the only mutation allowed
/// afterwards is [`FieldRegistry::push_derived`], which appends fields
/// produced by the line-of-sight integration.
#[derive(Debug)]
pub struct FieldRegistry {
    fields: Vec<Field>,
    index: FxHashMap<FieldName, usize>,
    distribution: Distribution,
    input_order: Vec<(usize, usize)>,
    input_pos: FxHashMap<(usize, usize), usize>,
}

impl FieldRegistry {
    /// Builds a registry from FIELDS_INFO records.
    ///
    /// # Errors
    ///
    /// Rejects duplicate names, windows with `zmin > zmax`, and, under the
    /// lognormal model, density fields with `mean + shift <= 0`.
    pub fn new(fields: Vec<Field>, distribution: Distribution) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::Input("field list is empty".to_owned()));
        }

        let mut index = FxHashMap::default();
        for (i, field) in fields.iter().enumerate() {
            if field.zmin > field.zmax {
                return Err(Error::Input(format!(
                    "field {}: zmin {} exceeds zmax {}",
                    field.name, field.zmin, field.zmax
                )));
            }
            if distribution == Distribution::Lognormal
                && field.kind == FieldKind::Density
                && field.mean + field.shift <= 0.0
            {
                return Err(Error::Input(format!(
                    "field {}: lognormal density needs mean + shift > 0, got {}",
                    field.name,
                    field.mean + field.shift
                )));
            }
            if index.insert(field.name, i).is_some() {
                return Err(Error::Input(format!("duplicate field {}", field.name)));
            }
        }

        Ok(Self {
            fields,
            index,
            distribution,
            input_order: Vec::new(),
            input_pos: FxHashMap::default(),
        })
    }

    /// Parses the whitespace-delimited FIELDS_INFO format: one line per
    /// field with columns `f z mean shift kind zmin zmax`. Empty lines and
    /// lines starting with `#` are skipped.
    ///
    /// # Errors
    ///
    /// Propagates the validation of [`FieldRegistry::new`] and rejects
    /// malformed lines.
    pub fn from_fields_info(text: &str, distribution: Distribution) -> Result<Self> {
        let mut fields = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let cols: Vec<_> = line.split_whitespace().collect();
            if cols.len() != 7 {
                return Err(Error::Input(format!(
                    "FIELDS_INFO line {}: expected 7 columns, found {}",
                    lineno + 1,
                    cols.len()
                )));
            }

            let parse = |what: &str, token: &str| -> Result<f64> {
                token.parse().map_err(|_| {
                    Error::Input(format!(
                        "FIELDS_INFO line {}: bad {what} '{token}'",
                        lineno + 1
                    ))
                })
            };

            let f = parse("field number", cols[0])?;
            let z = parse("slice number", cols[1])?;
            let kind_code = cols[4].parse::<i64>().map_err(|_| {
                Error::Input(format!(
                    "FIELDS_INFO line {}: bad kind '{}'",
                    lineno + 1,
                    cols[4]
                ))
            })?;
            let kind = FieldKind::from_code(kind_code).ok_or_else(|| {
                Error::Input(format!(
                    "FIELDS_INFO line {}: unknown field kind {kind_code}",
                    lineno + 1
                ))
            })?;

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let name = FieldName {
                f: f as u32,
                z: z as u32,
            };
            fields.push(Field {
                name,
                kind,
                mean: parse("mean", cols[2])?,
                shift: parse("shift", cols[3])?,
                zmin: parse("zmin", cols[5])?,
                zmax: parse("zmax", cols[6])?,
            });
        }

        Self::new(fields, distribution)
    }

    /// Number of fields, including derived ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// `true` when the registry holds no fields. Construction rejects this,
    /// so it only returns `true` for manually assembled test registries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The statistical model of this run.
    #[must_use]
    pub const fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Field metadata by index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    /// All fields in registry order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The (f, z) name of the field at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn index_to_name(&self, index: usize) -> FieldName {
        self.fields[index].name
    }

    /// Index of the field named `name`, or `None` for unknown names.
    #[must_use]
    pub fn name_to_index(&self, name: FieldName) -> Option<usize> {
        self.index.get(&name).copied()
    }

    /// Indices of all fields of the given kind, in registry order.
    pub fn indices_of(&self, kind: FieldKind) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(move |(_, field)| field.kind == kind)
            .map(|(i, _)| i)
    }

    /// Records the order in which (i, j) spectrum pairs appeared in the
    /// input. Later duplicates of a pair are ignored.
    pub fn record_input_order(&mut self, pairs: &[(usize, usize)]) {
        for &pair in pairs {
            if !self.input_pos.contains_key(&pair) {
                self.input_pos.insert(pair, self.input_order.len());
                self.input_order.push(pair);
            }
        }
    }

    /// The recorded input pair order.
    #[must_use]
    pub fn input_order(&self) -> &[(usize, usize)] {
        &self.input_order
    }

    /// Position of the pair (i, j) in the recorded input order.
    #[must_use]
    pub fn input_position(&self, i: usize, j: usize) -> Option<usize> {
        self.input_pos.get(&(i, j)).copied()
    }

    /// Appends a field derived by a later pipeline stage (the density →
    /// convergence integration) and returns its index.
    ///
    /// # Errors
    ///
    /// Rejects names that already exist.
    pub fn push_derived(&mut self, field: Field) -> Result<usize> {
        if self.index.contains_key(&field.name) {
            return Err(Error::Input(format!(
                "derived field {} already exists",
                field.name
            )));
        }
        let index = self.fields.len();
        self.index.insert(field.name, index);
        self.fields.push(field);
        Ok(index)
    }
}
