//! Typed covariate schema for the sample axis.
//!
//! Every categorical covariate is an enumerated domain with an explicit level
//! order; the first level is the reference that design matrices absorb into
//! the intercept. Free-form strings only appear for `mouseline`, whose levels
//! are sorted lexicographically so downstream column names are stable
//! regardless of sample order.

use crate::error::CovariateError;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Animal sex, reference level `F`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Sex {
    /// Female.
    F,
    /// Male.
    M,
}

impl Sex {
    /// Levels in design order.
    pub const ALL: [Sex; 2] = [Sex::F, Sex::M];

    fn label(self) -> &'static str {
        match self {
            Sex::F => "F",
            Sex::M => "M",
        }
    }
}

/// Experimental condition, reference level `Naive`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Condition {
    /// Unoperated control animals.
    Naive,
    /// Sham surgery controls.
    Sham,
    /// Spared nerve injury.
    Sni,
}

impl Condition {
    /// Levels in design order.
    pub const ALL: [Condition; 3] = [Condition::Naive, Condition::Sham, Condition::Sni];

    fn label(self) -> &'static str {
        match self {
            Condition::Naive => "Naive",
            Condition::Sham => "Sham",
            Condition::Sni => "SNI",
        }
    }
}

/// Days post surgery, reference level `2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Day {
    /// Day 2.
    Two,
    /// Day 7.
    Seven,
}

impl Day {
    /// Levels in design order.
    pub const ALL: [Day; 2] = [Day::Two, Day::Seven];

    fn label(self) -> &'static str {
        match self {
            Day::Two => "2",
            Day::Seven => "7",
        }
    }
}

/// Library processing arm, reference level `IP`.
///
/// Sample identifiers that carry no processing suffix are immunoprecipitation
/// libraries, so `IP` doubles as the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Processing {
    /// Ribosome-associated (immunoprecipitated) fraction.
    #[default]
    Ip,
    /// Total-RNA input fraction.
    Input,
}

impl Processing {
    /// Levels in design order.
    pub const ALL: [Processing; 2] = [Processing::Ip, Processing::Input];

    fn label(self) -> &'static str {
        match self {
            Processing::Ip => "IP",
            Processing::Input => "Input",
        }
    }
}

/// Condition crossed with day, the factor the main contrasts are written
/// against. Naive animals are only collected at day 7, so the domain has
/// five members, not six, and `Naive_7` is the reference level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CondDay {
    /// Naive, day 7.
    Naive7,
    /// Sham, day 2.
    Sham2,
    /// Sham, day 7.
    Sham7,
    /// SNI, day 2.
    Sni2,
    /// SNI, day 7.
    Sni7,
}

impl CondDay {
    /// Levels in design order.
    pub const ALL: [CondDay; 5] = [
        CondDay::Naive7,
        CondDay::Sham2,
        CondDay::Sham7,
        CondDay::Sni2,
        CondDay::Sni7,
    ];

    /// Derive the combined level, rejecting combinations outside the domain.
    pub fn new(condition: Condition, day: Day) -> Result<CondDay, CovariateError> {
        let v = match (condition, day) {
            (Condition::Naive, Day::Seven) => CondDay::Naive7,
            (Condition::Naive, Day::Two) => {
                return Err(CovariateError::NaiveDay {
                    day: Day::Two.to_string(),
                })
            }
            (Condition::Sham, Day::Two) => CondDay::Sham2,
            (Condition::Sham, Day::Seven) => CondDay::Sham7,
            (Condition::Sni, Day::Two) => CondDay::Sni2,
            (Condition::Sni, Day::Seven) => CondDay::Sni7,
        };
        Ok(v)
    }

    fn label(self) -> &'static str {
        match self {
            CondDay::Naive7 => "Naive_7",
            CondDay::Sham2 => "Sham_2",
            CondDay::Sham7 => "Sham_7",
            CondDay::Sni2 => "SNI_2",
            CondDay::Sni7 => "SNI_7",
        }
    }
}

macro_rules! impl_level_strings {
    ($($ty:ident => $domain:literal),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.label())
                }
            }

            impl FromStr for $ty {
                type Err = CovariateError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    $ty::ALL
                        .iter()
                        .copied()
                        .find(|v| v.label() == s)
                        .ok_or_else(|| CovariateError::UnknownLevel {
                            domain: $domain,
                            value: s.to_string(),
                        })
                }
            }
        )*
    };
}

impl_level_strings! {
    Sex => "sex",
    Condition => "condition",
    Day => "day",
    Processing => "processing",
    CondDay => "cond_day",
}

/// Covariates of a single sample. The combined `cond_day` level is derived
/// once at construction, so holding a `SampleInfo` proves the combination is
/// inside the domain.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleInfo {
    mouseline: String,
    sex: Sex,
    condition: Condition,
    day: Day,
    processing: Processing,
    cond_day: CondDay,
}

impl SampleInfo {
    /// Build a sample record, rejecting condition/day combinations outside
    /// the `cond_day` domain.
    pub fn new(
        mouseline: impl Into<String>,
        sex: Sex,
        condition: Condition,
        day: Day,
        processing: Processing,
    ) -> Result<SampleInfo, CovariateError> {
        let cond_day = CondDay::new(condition, day)?;
        Ok(SampleInfo {
            mouseline: mouseline.into(),
            sex,
            condition,
            day,
            processing,
            cond_day,
        })
    }

    /// Mouse line (TRAP driver lineage) label.
    pub fn mouseline(&self) -> &str {
        &self.mouseline
    }

    /// Animal sex.
    pub fn sex(&self) -> Sex {
        self.sex
    }

    /// Experimental condition.
    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Days post surgery.
    pub fn day(&self) -> Day {
        self.day
    }

    /// Library processing arm.
    pub fn processing(&self) -> Processing {
        self.processing
    }

    /// Derived condition-by-day level.
    pub fn cond_day(&self) -> CondDay {
        self.cond_day
    }
}

/// One categorical column: ordered levels plus a per-sample level code.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FactorColumn {
    /// Column name.
    pub name: String,
    /// Level labels in design order; the first is the reference.
    pub levels: Vec<String>,
    /// Per-sample index into `levels`.
    pub codes: Vec<usize>,
}

impl FactorColumn {
    /// Number of levels, including any with zero samples.
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Sample count per level.
    pub fn level_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.levels.len()];
        for &c in &self.codes {
            counts[c] += 1;
        }
        counts
    }
}

/// One appended numeric column, e.g. a surrogate variable.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NumericColumn {
    /// Column name.
    pub name: String,
    /// Per-sample value.
    pub values: Vec<f64>,
}

/// Column metadata for the sample axis: the fixed factor columns derived from
/// `SampleInfo`, plus numeric columns appended as the analysis runs.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CovariateTable {
    infos: Vec<SampleInfo>,
    factors: Vec<FactorColumn>,
    numeric: Vec<NumericColumn>,
}

/// Factor column names, in table order.
pub const FACTOR_NAMES: [&str; 6] = ["mouseline", "sex", "condition", "day", "processing", "cond_day"];

impl CovariateTable {
    /// Build the table from per-sample records. Enumerated factors carry
    /// their full domain as levels even when some levels have no samples;
    /// `mouseline` levels are the sorted distinct labels observed.
    pub fn new(infos: Vec<SampleInfo>) -> CovariateTable {
        let lines: Vec<String> = infos
            .iter()
            .map(|i| i.mouseline().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let line_codes = infos
            .iter()
            .map(|i| {
                lines
                    .iter()
                    .position(|l| l == i.mouseline())
                    .unwrap_or_default()
            })
            .collect();

        let factors = vec![
            FactorColumn {
                name: "mouseline".to_string(),
                levels: lines,
                codes: line_codes,
            },
            FactorColumn {
                name: "sex".to_string(),
                levels: Sex::ALL.iter().map(Sex::to_string).collect(),
                codes: infos.iter().map(|i| i.sex() as usize).collect(),
            },
            FactorColumn {
                name: "condition".to_string(),
                levels: Condition::ALL.iter().map(Condition::to_string).collect(),
                codes: infos.iter().map(|i| i.condition() as usize).collect(),
            },
            FactorColumn {
                name: "day".to_string(),
                levels: Day::ALL.iter().map(Day::to_string).collect(),
                codes: infos.iter().map(|i| i.day() as usize).collect(),
            },
            FactorColumn {
                name: "processing".to_string(),
                levels: Processing::ALL.iter().map(Processing::to_string).collect(),
                codes: infos.iter().map(|i| i.processing() as usize).collect(),
            },
            FactorColumn {
                name: "cond_day".to_string(),
                levels: CondDay::ALL.iter().map(CondDay::to_string).collect(),
                codes: infos.iter().map(|i| i.cond_day() as usize).collect(),
            },
        ];

        CovariateTable {
            infos,
            factors,
            numeric: Vec::new(),
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// True when the table has no samples.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Record for one sample.
    pub fn info(&self, sample: usize) -> &SampleInfo {
        &self.infos[sample]
    }

    /// All per-sample records, in sample order.
    pub fn infos(&self) -> &[SampleInfo] {
        &self.infos
    }

    /// Look up a factor column by name.
    pub fn factor(&self, name: &str) -> Result<&FactorColumn, CovariateError> {
        self.factors
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| CovariateError::UnknownColumn {
                name: name.to_string(),
            })
    }

    /// Look up a numeric column by name.
    pub fn numeric(&self, name: &str) -> Result<&[f64], CovariateError> {
        self.numeric
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
            .ok_or_else(|| CovariateError::UnknownColumn {
                name: name.to_string(),
            })
    }

    /// Names of appended numeric columns, in insertion order.
    pub fn numeric_names(&self) -> Vec<&str> {
        self.numeric.iter().map(|c| c.name.as_str()).collect()
    }

    /// Whether `name` resolves to a factor or numeric column.
    pub fn has_column(&self, name: &str) -> bool {
        self.factors.iter().any(|f| f.name == name) || self.numeric.iter().any(|c| c.name == name)
    }

    /// Append a numeric column (surrogate variables land here).
    pub fn append_numeric(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<(), CovariateError> {
        let name = name.into();
        if self.has_column(&name) {
            return Err(CovariateError::DuplicateColumn { name });
        }
        if values.len() != self.infos.len() {
            return Err(CovariateError::ColumnLength {
                name,
                len: values.len(),
                n: self.infos.len(),
            });
        }
        self.numeric.push(NumericColumn { name, values });
        Ok(())
    }

    /// Materialize the table for a sample subset. Factor levels left with no
    /// samples are dropped while the declared order of the remaining levels
    /// is preserved, the way R's `droplevels` behaves on a subset frame.
    pub fn subset(&self, idx: &[usize]) -> CovariateTable {
        let infos = idx.iter().map(|&i| self.infos[i].clone()).collect();
        let factors = self
            .factors
            .iter()
            .map(|f| {
                let mut used = vec![false; f.levels.len()];
                for &i in idx {
                    used[f.codes[i]] = true;
                }
                let mut remap = vec![usize::MAX; f.levels.len()];
                let mut levels = Vec::new();
                for (l, level) in f.levels.iter().enumerate() {
                    if used[l] {
                        remap[l] = levels.len();
                        levels.push(level.clone());
                    }
                }
                FactorColumn {
                    name: f.name.clone(),
                    levels,
                    codes: idx.iter().map(|&i| remap[f.codes[i]]).collect(),
                }
            })
            .collect();
        let numeric = self
            .numeric
            .iter()
            .map(|c| NumericColumn {
                name: c.name.clone(),
                values: idx.iter().map(|&i| c.values[i]).collect(),
            })
            .collect();

        CovariateTable {
            infos,
            factors,
            numeric,
        }
    }

    /// Indices of samples matching a predicate on their covariates.
    pub fn indices_where(&self, pred: impl Fn(&SampleInfo) -> bool) -> Vec<usize> {
        self.infos
            .iter()
            .enumerate()
            .filter_map(|(i, info)| pred(info).then_some(i))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(line: &str, sex: Sex, cond: Condition, day: Day) -> SampleInfo {
        SampleInfo::new(line, sex, cond, day, Processing::Ip).unwrap()
    }

    #[test]
    fn cond_day_domain_and_order() {
        // The combined factor has exactly five levels in a fixed order, with
        // the naive reference first.
        let labels: Vec<String> = CondDay::ALL.iter().map(CondDay::to_string).collect();
        assert_eq!(labels, vec!["Naive_7", "Sham_2", "Sham_7", "SNI_2", "SNI_7"]);

        assert_eq!(CondDay::new(Condition::Sni, Day::Two).unwrap(), CondDay::Sni2);
        assert!(matches!(
            CondDay::new(Condition::Naive, Day::Two),
            Err(CovariateError::NaiveDay { .. })
        ));
    }

    #[test]
    fn level_strings_round_trip() {
        assert_eq!("SNI".parse::<Condition>().unwrap(), Condition::Sni);
        assert_eq!("SNI_2".parse::<CondDay>().unwrap(), CondDay::Sni2);
        assert_eq!("IP".parse::<Processing>().unwrap(), Processing::Ip);
        assert_eq!(Day::Seven.to_string(), "7");
        assert!(matches!(
            "sni".parse::<Condition>(),
            Err(CovariateError::UnknownLevel { domain: "condition", .. })
        ));
    }

    #[test]
    fn naive_day_two_rejected_at_construction() {
        let err = SampleInfo::new("TdT", Sex::F, Condition::Naive, Day::Two, Processing::Ip);
        assert!(matches!(err, Err(CovariateError::NaiveDay { .. })));
    }

    #[test]
    fn mouseline_levels_sorted() {
        let table = CovariateTable::new(vec![
            info("Vglut2", Sex::F, Condition::Sham, Day::Two),
            info("TdT", Sex::M, Condition::Sni, Day::Seven),
            info("Gad2", Sex::F, Condition::Naive, Day::Seven),
        ]);
        let line = table.factor("mouseline").unwrap();
        assert_eq!(line.levels, vec!["Gad2", "TdT", "Vglut2"]);
        assert_eq!(line.codes, vec![2, 1, 0]);
    }

    #[test]
    fn full_domains_survive_missing_levels() {
        // No SNI sample present, but the declared domain still lists it so a
        // design built against this table can detect the empty level.
        let table = CovariateTable::new(vec![
            info("TdT", Sex::F, Condition::Naive, Day::Seven),
            info("TdT", Sex::M, Condition::Sham, Day::Two),
        ]);
        let cd = table.factor("cond_day").unwrap();
        assert_eq!(cd.n_levels(), 5);
        assert_eq!(cd.level_counts(), vec![1, 1, 0, 0, 0]);
    }

    #[test]
    fn subset_drops_empty_levels_in_declared_order() {
        let table = CovariateTable::new(vec![
            info("TdT", Sex::F, Condition::Naive, Day::Seven),
            info("TdT", Sex::M, Condition::Sham, Day::Two),
            info("TdT", Sex::F, Condition::Sni, Day::Two),
            info("TdT", Sex::M, Condition::Sni, Day::Seven),
        ]);
        let sub = table.subset(&[0, 3]);
        let cd = sub.factor("cond_day").unwrap();
        assert_eq!(cd.levels, vec!["Naive_7", "SNI_7"]);
        assert_eq!(cd.codes, vec![0, 1]);
        // The parent keeps its full domain.
        assert_eq!(table.factor("cond_day").unwrap().n_levels(), 5);
    }

    #[test]
    fn numeric_columns_append_and_subset() {
        let mut table = CovariateTable::new(vec![
            info("TdT", Sex::F, Condition::Naive, Day::Seven),
            info("TdT", Sex::M, Condition::Sham, Day::Two),
            info("TdT", Sex::F, Condition::Sni, Day::Two),
        ]);
        table.append_numeric("SV1", vec![0.1, -0.2, 0.3]).unwrap();
        assert!(matches!(
            table.append_numeric("SV1", vec![0.0, 0.0, 0.0]),
            Err(CovariateError::DuplicateColumn { .. })
        ));
        assert!(matches!(
            table.append_numeric("SV2", vec![0.0]),
            Err(CovariateError::ColumnLength { .. })
        ));
        assert_eq!(table.numeric_names(), vec!["SV1"]);

        let sub = table.subset(&[2, 0]);
        assert_eq!(sub.numeric("SV1").unwrap(), &[0.3, 0.1]);
        assert_eq!(sub.info(0).condition(), Condition::Sni);
    }

    #[test]
    fn indices_where_selects_by_predicate() {
        let table = CovariateTable::new(vec![
            info("TdT", Sex::F, Condition::Naive, Day::Seven),
            info("Gad2", Sex::M, Condition::Sni, Day::Two),
            info("TdT", Sex::F, Condition::Sni, Day::Seven),
        ]);
        let naive = table.indices_where(|i| i.condition() == Condition::Naive);
        assert_eq!(naive, vec![0]);
        let tdt = table.indices_where(|i| i.mouseline() == "TdT");
        assert_eq!(tdt, vec![0, 2]);
    }
}
