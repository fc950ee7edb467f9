//! External computation engines run inside batch jobs.
//!
//! An [`Engine`] turns a work item into a shell command for the job script
//! and knows how to read the result artifact the command leaves behind.
//! The artifact lives on the shared filesystem; nothing is returned through
//! the scheduler itself.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SchedError, SchedResult};
use crate::processing::WorkItem;
use crate::registry::{ItemResult, ParamValue, ParameterSet};

/// What a job has to run for one item, and where its result will be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    /// Shell command placed in the submission script.
    pub command: String,
    /// Result artifact written by the command.
    pub output_path: PathBuf,
}

/// An external program driven over the backlog.
pub trait Engine: Send + Sync {
    /// Short name, used in job names.
    fn name(&self) -> &str;

    /// The parameters every result of a run must share.
    fn run_parameters(&self) -> ParameterSet;

    /// Build the command for one item.
    fn prepare(&self, item: &WorkItem, run_dir: &Path) -> SchedResult<EngineInvocation>;

    /// Interpret the result artifact of one item.
    fn parse_output(&self, item: &WorkItem, output_path: &Path, contents: &str)
    -> SchedResult<ItemResult>;
}

/// Item attribute holding the pixel size in Å.
pub const ATTR_PIXEL_SIZE: &str = "pixel_size";
/// Item attribute holding the acceleration voltage in kV.
pub const ATTR_VOLTAGE_KV: &str = "voltage_kv";
/// Item attribute holding the nominal defocus in µm (sign ignored).
pub const ATTR_NOMINAL_DEFOCUS_UM: &str = "nominal_defocus_um";

/// Starting defocus in µm when neither the configuration, a prior fit nor
/// the item supplies one.
pub const FALLBACK_DEFOCUS_UM: f64 = 2.0;

/// Resolution reported for fits ctffind4 could not bound.
pub const UNBOUNDED_RESOLUTION: f64 = 100000.0;

const RESULT_COLUMNS: usize = 7;

/// ctffind4 search settings.
///
/// Lengths follow the ctffind4 conventions: resolutions in Å, defocus
/// step and astigmatism in µm (converted to Å for the program), phase
/// shifts in degrees (converted to radians).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtfFind4Params {
    pub amplitude_contrast: f64,
    /// Size of the amplitude spectrum, in pixels.
    pub field_size: u32,
    /// Spherical aberration in mm.
    pub cs: f64,
    /// Low resolution end of the fit, Å.
    pub resmin: f64,
    /// High resolution end of the fit, Å.
    pub resmax: f64,
    /// Grid search step, µm.
    pub defocus_step: f64,
    /// Grid steps searched on either side of the starting defocus.
    pub defocus_steps: u32,
    /// Tolerated astigmatism, µm.
    pub astigmatism: f64,
    /// Override the per-image nominal defocus, µm.
    pub nominal_defocus: Option<f64>,
    /// Seed amplitude contrast and astigmatism from the prior result.
    pub best_db: bool,
    pub exhaustive_search: bool,
    /// Search for an additional phase shift (phase plate data).
    pub phase_plate: bool,
    pub min_phase_shift: f64,
    pub max_phase_shift: f64,
    pub phase_search_step: f64,
}

impl Default for CtfFind4Params {
    fn default() -> Self {
        Self {
            amplitude_contrast: 0.07,
            field_size: 1024,
            cs: 2.7,
            resmin: 50.0,
            resmax: 15.0,
            defocus_step: 0.05,
            defocus_steps: 25,
            astigmatism: 0.1,
            nominal_defocus: None,
            best_db: false,
            exhaustive_search: false,
            phase_plate: false,
            min_phase_shift: 10.0,
            max_phase_shift: 170.0,
            phase_search_step: 10.0,
        }
    }
}

impl CtfFind4Params {
    /// Reject settings ctffind4 cannot fit with.
    pub fn validate(&self) -> SchedResult<()> {
        if !(10.0..=50.0).contains(&self.resmin) {
            return Err(SchedError::ConfigError(format!(
                "resmin must be between 10 and 50 Å, got {}",
                self.resmin
            )));
        }
        if self.resmax > 15.0 || self.resmax > self.resmin {
            return Err(SchedError::ConfigError(format!(
                "resmax must be at most 15 Å and below resmin, got {}",
                self.resmax
            )));
        }
        if !(0.0001..=2.0).contains(&self.defocus_step) {
            return Err(SchedError::ConfigError(format!(
                "defocus step must be between 0.0001 and 2 µm, got {}",
                self.defocus_step
            )));
        }
        Ok(())
    }
}

/// Defocus search window in Å around `best_defocus`.
///
/// A negative lower bound is replaced by one step.
pub fn defocus_range(best_defocus: f64, step_um: f64, steps: u32) -> (f64, f64) {
    let step = step_um * 1e4;
    let span = step * f64::from(steps);
    let mut min = round1(best_defocus - span);
    if min < 0.0 {
        warn!("Defocus minimum {:.1} Å is below zero, using {:.1} Å", min, step);
        min = step;
    }
    (min, round1(best_defocus + span))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// CTF estimation with ctffind4, answering its prompts on stdin.
#[derive(Debug, Clone)]
pub struct CtfFind4Engine {
    executable: PathBuf,
    params: CtfFind4Params,
}

impl CtfFind4Engine {
    pub fn new(executable: impl Into<PathBuf>, params: CtfFind4Params) -> Self {
        Self {
            executable: executable.into(),
            params,
        }
    }

    pub fn params(&self) -> &CtfFind4Params {
        &self.params
    }

    fn attribute(item: &WorkItem, name: &str) -> SchedResult<f64> {
        item.attributes
            .get(name)
            .copied()
            .ok_or_else(|| SchedError::EngineInput(format!("item {} has no {name}", item.id)))
    }

    /// Starting defocus in Å.
    ///
    /// In order: the configured override, the smaller defocus of the prior
    /// fit, the item's nominal value, [`FALLBACK_DEFOCUS_UM`].
    fn best_defocus(&self, item: &WorkItem) -> f64 {
        if let Some(nominal) = self.params.nominal_defocus {
            return (nominal * 1e4).abs();
        }
        if let Some(prior) = &item.prior {
            if let (Some(d1), Some(d2)) = (prior.fields.get("defocus1"), prior.fields.get("defocus2")) {
                return d1.min(*d2);
            }
        }
        match item.attributes.get(ATTR_NOMINAL_DEFOCUS_UM) {
            Some(nominal) => (nominal * 1e4).abs(),
            None => {
                warn!(
                    "Item {} has no {}, searching around {} µm",
                    item.id, ATTR_NOMINAL_DEFOCUS_UM, FALLBACK_DEFOCUS_UM
                );
                FALLBACK_DEFOCUS_UM * 1e4
            }
        }
    }

    /// Amplitude contrast and tolerated astigmatism (Å) for this item.
    fn seeded_values(&self, item: &WorkItem) -> (f64, f64) {
        let default_astig = self.params.astigmatism * 1e4;
        let prior = match (&item.prior, self.params.best_db) {
            (Some(prior), true) => prior,
            _ => return (self.params.amplitude_contrast, default_astig),
        };

        let contrast = prior
            .fields
            .get("amplitude_contrast")
            .copied()
            .filter(|c| *c > 0.0)
            .map_or(self.params.amplitude_contrast, |c| (c * 1000.0).round() / 1000.0);
        let astig = match (prior.fields.get("defocus1"), prior.fields.get("defocus2")) {
            (Some(d1), Some(d2)) if (d1 - d2).abs() >= 10.0 => round1((d1 - d2).abs()),
            _ => default_astig,
        };
        (contrast, astig)
    }

    fn answers(&self, item: &WorkItem, input: &str, output: &str) -> SchedResult<Vec<String>> {
        let p = &self.params;
        let pixel_size = Self::attribute(item, ATTR_PIXEL_SIZE)?;
        let voltage = Self::attribute(item, ATTR_VOLTAGE_KV)?;
        let (contrast, astig) = self.seeded_values(item);
        let (defmin, defmax) =
            defocus_range(self.best_defocus(item), p.defocus_step, p.defocus_steps);

        let mut answers = vec![
            input.to_string(),
            output.to_string(),
            pixel_size.to_string(),
            voltage.to_string(),
            p.cs.to_string(),
            contrast.to_string(),
            p.field_size.to_string(),
            p.resmin.to_string(),
            p.resmax.to_string(),
            defmin.to_string(),
            defmax.to_string(),
            (p.defocus_step * 1e4).to_string(),
            // Known astigmatism?
            "no".to_string(),
            yes_no(p.exhaustive_search),
            // Restrain astigmatism?
            "yes".to_string(),
            astig.to_string(),
            yes_no(p.phase_plate),
        ];
        if p.phase_plate {
            answers.push(p.min_phase_shift.to_radians().to_string());
            answers.push(p.max_phase_shift.to_radians().to_string());
            answers.push(p.phase_search_step.to_radians().to_string());
        }
        // Expert options?
        answers.push("no".to_string());
        Ok(answers)
    }
}

impl Engine for CtfFind4Engine {
    fn name(&self) -> &str {
        "ctffind4"
    }

    fn run_parameters(&self) -> ParameterSet {
        let p = &self.params;
        let mut set = ParameterSet::new();
        set.insert("ampcontrast".to_string(), ParamValue::Float(p.amplitude_contrast));
        set.insert("fieldsize".to_string(), ParamValue::Int(i64::from(p.field_size)));
        set.insert("cs".to_string(), ParamValue::Float(p.cs));
        set.insert("bestdb".to_string(), ParamValue::Bool(p.best_db));
        set.insert("resmin".to_string(), ParamValue::Float(p.resmin));
        set.insert("defstep".to_string(), ParamValue::Float(p.defocus_step));
        set.insert("shift_phase".to_string(), ParamValue::Bool(p.phase_plate));
        if p.phase_plate {
            set.insert("min_phase_shift".to_string(), ParamValue::Float(p.min_phase_shift));
            set.insert("max_phase_shift".to_string(), ParamValue::Float(p.max_phase_shift));
            set.insert(
                "phase_search_step".to_string(),
                ParamValue::Float(p.phase_search_step),
            );
        }
        set
    }

    fn prepare(&self, item: &WorkItem, run_dir: &Path) -> SchedResult<EngineInvocation> {
        let input = run_dir.join(format!("{}.mrc", item.id));
        let diagnostic = run_dir.join(format!("{}-pow.mrc", item.id));
        let output_path = run_dir.join(format!("{}-pow.txt", item.id));

        let answers = self.answers(
            item,
            &input.display().to_string(),
            &diagnostic.display().to_string(),
        )?;

        let mut command = String::new();
        command.push_str(&format!("cd {}\n", shell_quote(&run_dir.display().to_string())));
        command.push_str(&format!(
            "ln -sf {} {}\n",
            shell_quote(&item.source.display().to_string()),
            shell_quote(&input.display().to_string())
        ));
        // ctffind4 refuses to overwrite its diagnostic image
        command.push_str(&format!(
            "rm -f {}\n",
            shell_quote(&diagnostic.display().to_string())
        ));
        command.push_str(&format!(
            "{} << 'CTFFIND4_ANSWERS'\n",
            shell_quote(&self.executable.display().to_string())
        ));
        for answer in answers {
            command.push_str(&answer);
            command.push('\n');
        }
        command.push_str("CTFFIND4_ANSWERS");

        Ok(EngineInvocation {
            command,
            output_path,
        })
    }

    fn parse_output(
        &self,
        item: &WorkItem,
        output_path: &Path,
        contents: &str,
    ) -> SchedResult<ItemResult> {
        let invalid = |message: String| SchedError::InvalidOutput {
            path: output_path.to_path_buf(),
            message,
        };

        let mut columns: Option<Vec<f64>> = None;
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bits: Vec<&str> = line.split_whitespace().collect();
            if bits.len() < RESULT_COLUMNS {
                return Err(invalid(format!(
                    "expected {RESULT_COLUMNS} columns, found {}",
                    bits.len()
                )));
            }
            let values = bits[..RESULT_COLUMNS]
                .iter()
                .map(|bit| bit.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid(format!("non-numeric column: {e}")))?;
            if values[..6].iter().any(|v| !v.is_finite()) || values[6].is_nan() {
                return Err(invalid("non-finite value".to_string()));
            }
            // Each data line describes the whole micrograph; the last one wins.
            columns = Some(values);
        }

        let values = columns.ok_or_else(|| invalid("no result line".to_string()))?;
        let cc = values[5];
        let resolution = if values[6].is_infinite() {
            UNBOUNDED_RESOLUTION
        } else {
            values[6]
        };
        let (contrast, _) = self.seeded_values(item);

        Ok(ItemResult::new(item.id.clone(), cc)
            .with_field("image_number", values[0])
            .with_field("defocus2", values[1])
            .with_field("defocus1", values[2])
            .with_field("angle_astigmatism", values[3] + 90.0)
            .with_field("extra_phase_shift", values[4])
            .with_field("cross_correlation", cc)
            .with_field("resolution", resolution)
            .with_field("amplitude_contrast", contrast)
            .with_field("confidence_d", ((cc.abs().sqrt()) * 1e5).round() / 1e5))
    }
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

/// Quote a string for POSIX sh.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new("img_0001", "/data/session1/img_0001.mrc")
            .with_attribute(ATTR_PIXEL_SIZE, 1.06)
            .with_attribute(ATTR_VOLTAGE_KV, 300.0)
            .with_attribute(ATTR_NOMINAL_DEFOCUS_UM, -2.0)
    }

    const OUTPUT: &str = "\
# Output from CTFFind version 4.1.14
# Input file: /scratch/run1/img_0001.mrc ; Number of micrographs: 1
# Columns: #1 - micrograph number; #2 - defocus 1 [Angstroms]; ...
1.000000 21480.41 20955.17 -41.21 0.000000 0.183220 4.280000
";

    #[test]
    fn test_defocus_range() {
        assert_eq!(defocus_range(20000.0, 0.02, 25), (15000.0, 25000.0));
        // Below zero the minimum falls back to one step.
        assert_eq!(defocus_range(3000.0, 0.02, 25), (200.0, 8000.0));
    }

    #[test]
    fn test_validate() {
        assert!(CtfFind4Params::default().validate().is_ok());
        let params = CtfFind4Params {
            resmin: 60.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
        let params = CtfFind4Params {
            resmax: 20.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
        let params = CtfFind4Params {
            defocus_step: 5.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_prepare_answers() {
        let engine = CtfFind4Engine::new("/opt/ctffind4/bin/ctffind4", CtfFind4Params::default());
        let invocation = engine.prepare(&item(), Path::new("/scratch/run1")).unwrap();

        assert_eq!(invocation.output_path, Path::new("/scratch/run1/img_0001-pow.txt"));
        let lines: Vec<&str> = invocation.command.lines().collect();
        assert_eq!(lines[0], "cd /scratch/run1");
        assert_eq!(
            lines[1],
            "ln -sf /data/session1/img_0001.mrc /scratch/run1/img_0001.mrc"
        );
        assert_eq!(lines[3], "/opt/ctffind4/bin/ctffind4 << 'CTFFIND4_ANSWERS'");
        assert_eq!(
            &lines[4..],
            &[
                "/scratch/run1/img_0001.mrc",
                "/scratch/run1/img_0001-pow.mrc",
                "1.06",
                "300",
                "2.7",
                "0.07",
                "1024",
                "50",
                "15",
                "7500",
                "32500",
                "500",
                "no",
                "no",
                "yes",
                "1000",
                "no",
                "no",
                "CTFFIND4_ANSWERS",
            ]
        );
    }

    #[test]
    fn test_prepare_uses_prior_defocus() {
        let engine = CtfFind4Engine::new("ctffind4", CtfFind4Params::default());
        let item = item().with_prior(
            ItemResult::new("img_0001", 0.1)
                .with_field("defocus1", 15000.0)
                .with_field("defocus2", 14000.0),
        );
        let command = engine.prepare(&item, Path::new("/r")).unwrap().command;
        assert!(command.contains("\n1500\n26500\n"));
    }

    #[test]
    fn test_prepare_without_nominal_defocus() {
        let engine = CtfFind4Engine::new("ctffind4", CtfFind4Params::default());
        let item = WorkItem::new("img_0003", "/data/img_0003.mrc")
            .with_attribute(ATTR_PIXEL_SIZE, 1.06)
            .with_attribute(ATTR_VOLTAGE_KV, 300.0);
        let command = engine.prepare(&item, Path::new("/r")).unwrap().command;
        // 2 µm ± 25 steps of 0.05 µm
        assert!(command.contains("\n7500\n32500\n"));
    }

    #[test]
    fn test_prepare_requires_attributes() {
        let engine = CtfFind4Engine::new("ctffind4", CtfFind4Params::default());
        let item = WorkItem::new("img_0002", "/data/img_0002.mrc");
        let err = engine.prepare(&item, Path::new("/r")).unwrap_err();
        assert!(matches!(err, SchedError::EngineInput(_)));
        assert!(err.is_item_permanent());
    }

    #[test]
    fn test_parse_output() {
        let engine = CtfFind4Engine::new("ctffind4", CtfFind4Params::default());
        let result = engine
            .parse_output(&item(), Path::new("img_0001-pow.txt"), OUTPUT)
            .unwrap();

        assert_eq!(result.item, "img_0001");
        assert_eq!(result.confidence, 0.18322);
        assert_eq!(result.fields["defocus1"], 20955.17);
        assert_eq!(result.fields["defocus2"], 21480.41);
        assert!((result.fields["angle_astigmatism"] - 48.79).abs() < 1e-9);
        assert_eq!(result.fields["resolution"], 4.28);
        assert_eq!(result.fields["confidence_d"], 0.42804);
    }

    #[test]
    fn test_parse_output_infinite_resolution() {
        let engine = CtfFind4Engine::new("ctffind4", CtfFind4Params::default());
        let contents = "1 21480.41 20955.17 -41.21 0.0 0.02 inf\n";
        let result = engine
            .parse_output(&item(), Path::new("x"), contents)
            .unwrap();
        assert_eq!(result.fields["resolution"], UNBOUNDED_RESOLUTION);
    }

    #[test]
    fn test_parse_output_rejects_short_lines() {
        let engine = CtfFind4Engine::new("ctffind4", CtfFind4Params::default());
        for contents in [
            "# only comments\n",
            "",
            "1.0 21480.41 20955.17 -41.21\n",
            "1.0 21480.41 20955.17 -41.21 0.0 nan 4.2\n",
            "1.0 21480.41 abc -41.21 0.0 0.1 4.2\n",
        ] {
            let err = engine
                .parse_output(&item(), Path::new("x"), contents)
                .unwrap_err();
            assert!(matches!(err, SchedError::InvalidOutput { .. }), "{contents:?}");
        }
    }

    #[test]
    fn test_run_parameters() {
        let engine = CtfFind4Engine::new("ctffind4", CtfFind4Params::default());
        let params = engine.run_parameters();
        assert_eq!(params.len(), 7);
        assert_eq!(params["cs"], ParamValue::Float(2.7));

        let engine = CtfFind4Engine::new(
            "ctffind4",
            CtfFind4Params {
                phase_plate: true,
                ..Default::default()
            },
        );
        assert_eq!(engine.run_parameters().len(), 10);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/img.mrc"), "/data/img.mrc");
        assert_eq!(shell_quote("my file"), "'my file'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
