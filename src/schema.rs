use crate::error::{ReconcileError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Where things live in the target cost matrix. Rows and columns are 1-based,
/// as a spreadsheet user would count them (column 5 = E).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TargetLayout {
    #[schemars(description = "Name of the worksheet holding the operations x employees x months matrix.")]
    pub sheet_name: String,

    #[schemars(description = "1-based row holding the month headers (dates or 'YYYY-MM' prefixed labels).")]
    pub header_row: u32,

    #[schemars(
        description = "1-based column carrying operation section headers and employee names (5 = column E)."
    )]
    pub label_column: u16,

    #[schemars(description = "1-based column of the first month (6 = column F).")]
    pub first_month_column: u16,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self {
            sheet_name: "Project".to_string(),
            header_row: 1,
            label_column: 5,
            first_month_column: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconcilerConfig {
    #[schemars(
        description = "Work package code exactly as exported by the timesheet system, mapped to the operation label used in the target sheet. Many codes may map to one operation."
    )]
    pub work_package_to_operation: BTreeMap<String, String>,

    #[schemars(
        description = "Canonical employee identity mapped to every spelling accepted for that person. Matching is case-insensitive and ignores surrounding whitespace."
    )]
    pub name_aliases: BTreeMap<String, Vec<String>>,

    #[schemars(
        description = "Label-column values that are never employee rows (totals, provider lines, cost categories). Compared case-insensitively."
    )]
    #[serde(default)]
    pub skip_labels: Vec<String>,

    #[schemars(description = "Label that ends the per-employee area of the target sheet.")]
    #[serde(default = "default_terminator")]
    pub terminator_label: String,

    #[schemars(description = "RGB hex colour (e.g. 'FFA500') used for the font of machine-updated cells.")]
    #[serde(default = "default_highlight")]
    pub highlight_color: String,

    #[serde(default)]
    pub target_layout: TargetLayout,
}

fn default_terminator() -> String {
    "Accumulated Total".to_string()
}

fn default_highlight() -> String {
    "FFA500".to_string()
}

impl ReconcilerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ReconcileError::io("config load", path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let layout = &self.target_layout;
        if layout.header_row == 0 || layout.label_column == 0 || layout.first_month_column == 0 {
            return Err(ReconcileError::InvalidConfig(
                "target layout rows and columns are 1-based and must be non-zero".to_string(),
            ));
        }
        if layout.label_column >= layout.first_month_column {
            return Err(ReconcileError::InvalidConfig(format!(
                "label column {} must lie left of the first month column {}",
                layout.label_column, layout.first_month_column
            )));
        }
        if self.terminator_label.trim().is_empty() {
            return Err(ReconcileError::InvalidConfig(
                "terminator label must not be empty".to_string(),
            ));
        }
        self.highlight_rgb()?;
        self.check_alias_owners()?;
        Ok(())
    }

    /// Every spelling, compared trimmed and case-insensitively, must resolve
    /// to exactly one canonical name.
    fn check_alias_owners(&self) -> Result<()> {
        let mut owners: HashMap<String, &str> = HashMap::new();
        for (canonical, spellings) in &self.name_aliases {
            for spelling in std::iter::once(canonical).chain(spellings) {
                let key = spelling.trim().to_lowercase();
                if key.is_empty() {
                    continue;
                }
                match owners.insert(key, canonical.as_str()) {
                    Some(other) if other != canonical.as_str() => {
                        return Err(ReconcileError::InvalidConfig(format!(
                            "name '{}' is listed under both '{}' and '{}'",
                            spelling.trim(),
                            other,
                            canonical
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Highlight colour as a 0xRRGGBB integer.
    pub fn highlight_rgb(&self) -> Result<u32> {
        let hex = self.highlight_color.trim().trim_start_matches('#');
        if hex.len() != 6 {
            return Err(ReconcileError::InvalidConfig(format!(
                "highlight colour '{}' must be six hex digits",
                self.highlight_color
            )));
        }
        u32::from_str_radix(hex, 16).map_err(|_| {
            ReconcileError::InvalidConfig(format!(
                "highlight colour '{}' is not valid hex",
                self.highlight_color
            ))
        })
    }

    /// Every operation label a work package can resolve to.
    pub fn operation_labels(&self) -> BTreeSet<String> {
        self.work_package_to_operation
            .values()
            .map(|op| op.trim().to_string())
            .collect()
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReconcilerConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let work_package_to_operation = [
            ("001 / Avature Crew  - PM/CM", "Avature Crew"),
            ("003 / Avature Crew  - Testcenter", "Avature Crew"),
            ("004 / Avature Crew  - Integrations", "Avature Crew"),
            ("052 / Avature Crew - Pre-/Onboarding", "Avature Preboarding"),
            ("007 / Eightfold Crew  - Testcenter", "Eightfold Crew"),
            ("005 / Eightfold Crew - PM/CM", "Eightfold Crew"),
            ("008 / Eightfold Crew  - Integrations", "Eightfold Crew"),
            ("053 / Ext.Careers Portal Crew - PM/CM", "Avature ext. Careers Portal Crew"),
            ("054 / Ext.Careers Portal Crew - Integration", "Avature ext. Careers Portal Crew"),
            ("056 / Ext.Careers Portal Crew - Testcenter", "Avature ext. Careers Portal Crew"),
        ]
        .into_iter()
        .map(|(code, op)| (code.to_string(), op.to_string()))
        .collect();

        let name_aliases: &[(&str, &[&str])] = &[
            (
                "Assuncao Gambetta Clemente, Fernanda",
                &["Fernanda Assuncao Gambetta Clemente"],
            ),
            ("Magro, Daniel", &[]),
            (
                "Pires Rosa, Claudia",
                &[
                    "Claudia Pires Rosa",
                    "Rosa, Claudia (ext)",
                    "Pires Rosa, Claudia (ext)",
                    "Claudia Rosa",
                ],
            ),
            (
                "Helbing, Björn",
                &["Helbing, Bjoern", "B. Helbing", "Björn Helbing"],
            ),
            (
                "Matos Oliveira, Ana Rita",
                &[
                    "Ana Rita Matos Oliveira",
                    "Matos dos Santos Oliveira, Ana Rita",
                    "Matos Oliveira, Rita",
                ],
            ),
            (
                "Pires, Filipe",
                &["Guerreiro Luis Pires, Filipe Viegas", "Filipe Pires"],
            ),
            (
                "Plácido, Andreia",
                &[
                    "Moreira Cristo Placido, Andreia Sofia",
                    "Andreia Plácido",
                    "Andreia Sofia Moreira Cristo Placido",
                ],
            ),
            ("Antunes, Ricardo", &["Ricardo Antunes"]),
            (
                "Fernandes Redondo, Amanda",
                &["Amanda Fernandes Redondo", "Fernandez Redondo, Amanda"],
            ),
            ("Zouine, Meryem", &["Meryem Zouine"]),
            ("Cerezo, Alberto", &["Cerezo Ruiz, Alberto", "Alberto Cerezo"]),
            ("Swoboda, Claudia", &["Claudia Swoboda"]),
            (
                "Bicho, Rita",
                &[
                    "Lazaro Bicho, Rita Sofia",
                    "Rita Bicho",
                    "Rita Sofia Lazaro Bicho",
                ],
            ),
            ("Lopes Fonseca, Mario Andre", &["Mario Andre Lopes Fonseca"]),
            ("Wiesheu, Andreas", &["Andreas Wiesheu"]),
            ("Heldwein, Christian", &["Christian Heldwein"]),
            ("Hernandes Vaz, Joao Rafael", &["Joao Rafael Hernandes Vaz"]),
            ("Vitorino, Diana", &["Diana Vitorino"]),
            (
                "Candeias Gracioso, Sara Margarida",
                &["Sara Margarida Candeias Gracioso"],
            ),
            (
                "do Nascimento Matos Manso, Rui Pedro",
                &["Rui Pedro do Nascimento Matos Manso"],
            ),
        ];
        let name_aliases = name_aliases
            .iter()
            .map(|(canonical, aliases)| {
                let mut spellings = vec![canonical.to_string()];
                spellings.extend(aliases.iter().map(|a| a.to_string()));
                (canonical.to_string(), spellings)
            })
            .collect();

        let skip_labels = [
            "Test - ARE 5240",
            "Service Management - ARE 5290 + int.",
            "JCC",
            "CHCM (Eviden)",
            "AWS Encryption Key (KMS for Eightfold; GBS)",
            "DirX (Ext)/(SAG Global)",
            "Integrations DPS",
            "GBS total",
            "TRE (Tupu) PO",
            "Eightfold (PO Q1/2025: 9708791569; Q2-Q4: tbd.)",
            "Provider",
            "CERT check (pen GBS)",
            "Accessibility Test",
            "Travel & Hospitality",
            "Additional costs",
            "Total Costs",
            "Accumulated costs Eightfold Crew",
            "DirX PT -  5240",
            "DirX (Eviden)",
            "TRE (Tupu) (PO tbd)",
            "Eightfold",
            "Avature DT (PO 9708872111)",
            "Avature AM (PO 9708872111)",
            "Avature Healthcheck (PO",
            "Accumulated costs Avature Crew",
            "CHCM (Evdien)",
            "Avature ext. Careers Portal (PO 9709043748) - PDP",
            "Avature ext. Careers Portal (PO 9709132497)",
            "Travel & Hospitality ext. Provider",
            "Travel & Hospitality DE",
            "Travel & Hospitality ES / CZ / PT",
            "Accumulated costs Ext. Careers Port Crew",
            "Accumulated costs Preboarding",
            "Service Management",
            "Total",
            "Avature",
            "DPS Internal Umlage (global)",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        Self {
            work_package_to_operation,
            name_aliases,
            skip_labels,
            terminator_label: default_terminator(),
            highlight_color: default_highlight(),
            target_layout: TargetLayout::default(),
        }
    }
}
