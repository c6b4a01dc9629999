//! QF-004: Descriptor grammar — input file names to derived output names.
//!
//! Input names follow `cohort-platform-descriptor.suffix`. The derived stem is
//! `cohort-platform1_descriptor1-platform2_descriptor2`, with the cohort taken
//! from the genotype file only. Full outputs are `{stem}.{tool_suffix}[.more]`.
//!
//! Everything here is pure string manipulation.

use std::path::Path;

/// Placeholder for fields the file name does not carry.
pub const PLACEHOLDER: &str = "NA";

/// A parsed `cohort-platform-descriptor.suffix` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub cohort: String,
    pub platform: String,
    pub descriptor: String,
    pub suffix: String,
}

fn field(raw: Option<&str>) -> String {
    match raw {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => PLACEHOLDER.to_string(),
    }
}

impl FileDescriptor {
    /// Parse a file name (directory components are ignored). Never fails:
    /// missing or empty fields become [`PLACEHOLDER`]. A name with more than
    /// three hyphen fields keeps the remainder in `descriptor`.
    pub fn parse(file_name: &str) -> Self {
        let base = Path::new(file_name)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.to_string());

        let (body, suffix) = match base.split_once('.') {
            Some((body, suffix)) => (body, Some(suffix)),
            None => (base.as_str(), None),
        };

        let mut fields = body.splitn(3, '-');
        Self {
            cohort: field(fields.next()),
            platform: field(fields.next()),
            descriptor: field(fields.next()),
            suffix: field(suffix),
        }
    }

    /// `platform_descriptor`, the per-file part of a derived stem.
    pub fn platform_descriptor(&self) -> String {
        format!("{}_{}", self.platform, self.descriptor)
    }
}

/// Derive the output stem for a genotype/phenotype pair.
///
/// A non-empty `override_prefix` is returned verbatim and no parsing happens.
/// The phenotype file's cohort is ignored, even when it differs.
pub fn derive_stem(genotype: &str, phenotype: &str, override_prefix: Option<&str>) -> String {
    if let Some(prefix) = override_prefix.filter(|p| !p.is_empty()) {
        return prefix.to_string();
    }
    let geno = FileDescriptor::parse(genotype);
    let pheno = FileDescriptor::parse(phenotype);
    format!(
        "{}-{}-{}",
        geno.cohort,
        geno.platform_descriptor(),
        pheno.platform_descriptor()
    )
}

/// Join a stem with a tool suffix and optional sub-result parts:
/// `{stem}.{tool_suffix}[.part]...`. Empty parts are dropped.
pub fn output_name(stem: &str, tool_suffix: &str, parts: &[&str]) -> String {
    let mut name = stem.to_string();
    for part in std::iter::once(tool_suffix).chain(parts.iter().copied()) {
        if part.is_empty() {
            continue;
        }
        name.push('.');
        name.push_str(part.trim_start_matches('.'));
    }
    name
}

/// `{stem}.{new_suffix}` for a genotype/phenotype pair.
pub fn derive_output_name(
    genotype: &str,
    phenotype: &str,
    override_prefix: Option<&str>,
    new_suffix: &str,
) -> String {
    output_name(
        &derive_stem(genotype, phenotype, override_prefix),
        new_suffix,
        &[],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_qf004_parse_full_name() {
        let d = FileDescriptor::parse("airwave-illumina_exome-all_chrs.geno");
        assert_eq!(d.cohort, "airwave");
        assert_eq!(d.platform, "illumina_exome");
        assert_eq!(d.descriptor, "all_chrs");
        assert_eq!(d.suffix, "geno");
    }

    #[test]
    fn test_qf004_airwave_example() {
        let stem = derive_stem(
            "airwave-illumina_exome-all_chrs.geno",
            "airwave-NMR-blood.txt",
            None,
        );
        assert_eq!(stem, "airwave-illumina_exome_all_chrs-NMR_blood");
        assert_eq!(
            derive_output_name(
                "airwave-illumina_exome-all_chrs.geno",
                "airwave-NMR-blood.txt",
                None,
                "MxEQTL"
            ),
            "airwave-illumina_exome_all_chrs-NMR_blood.MxEQTL"
        );
    }

    #[test]
    fn test_qf004_single_field_degrades_to_placeholders() {
        let d = FileDescriptor::parse("SNP.txt");
        assert_eq!(d.cohort, "SNP");
        assert_eq!(d.platform, "NA");
        assert_eq!(d.descriptor, "NA");
        assert_eq!(d.suffix, "txt");

        let stem = derive_stem("SNP.txt", "GE.txt", None);
        assert_eq!(stem, "SNP-NA_NA-NA_NA");
        assert!(stem.contains("NA-NA"));
    }

    #[test]
    fn test_qf004_phenotype_cohort_ignored() {
        let stem = derive_stem("cohortA-chip-x.geno", "cohortB-rna-y.txt", None);
        assert_eq!(stem, "cohortA-chip_x-rna_y");
    }

    #[test]
    fn test_qf004_override_prefix_skips_parsing() {
        let stem = derive_stem("whatever", "names.txt", Some("my_run"));
        assert_eq!(stem, "my_run");
        let empty = derive_stem("a-b-c.geno", "a-d-e.txt", Some(""));
        assert_eq!(empty, "a-b_c-d_e");
    }

    #[test]
    fn test_qf004_suffix_split_on_first_dot() {
        let d = FileDescriptor::parse("c-p-d.tar.gz");
        assert_eq!(d.descriptor, "d");
        assert_eq!(d.suffix, "tar.gz");
    }

    #[test]
    fn test_qf004_extra_hyphens_kept_in_descriptor() {
        let d = FileDescriptor::parse("c-p-d1-d2.txt");
        assert_eq!(d.descriptor, "d1-d2");
    }

    #[test]
    fn test_qf004_directories_ignored() {
        let d = FileDescriptor::parse("data/raw/airwave-NMR-blood.txt");
        assert_eq!(d.cohort, "airwave");
        assert_eq!(d.platform, "NMR");
    }

    #[test]
    fn test_qf004_empty_fields_and_missing_suffix() {
        let d = FileDescriptor::parse("-p-");
        assert_eq!(d.cohort, "NA");
        assert_eq!(d.platform, "p");
        assert_eq!(d.descriptor, "NA");
        assert_eq!(d.suffix, "NA");
    }

    #[test]
    fn test_qf004_output_name_parts() {
        let stem = "airwave-illumina_exome_all_chrs-NMR_blood";
        assert_eq!(output_name(stem, "MxEQTL", &["cis"]), format!("{stem}.MxEQTL.cis"));
        assert_eq!(
            output_name(stem, "MxEQTL", &["qqplot", "svg"]),
            format!("{stem}.MxEQTL.qqplot.svg")
        );
        assert_eq!(output_name(stem, "MxEQTL", &["", ".log"]), format!("{stem}.MxEQTL.log"));
    }

    fn name_field() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_]{1,12}"
    }

    proptest! {
        #[test]
        fn prop_qf004_grammar_fields_recovered(
            c in name_field(), p in name_field(), d in name_field(), s in name_field()
        ) {
            let parsed = FileDescriptor::parse(&format!("{c}-{p}-{d}.{s}"));
            prop_assert_eq!(parsed.cohort, c);
            prop_assert_eq!(parsed.platform, p);
            prop_assert_eq!(parsed.descriptor, d);
            prop_assert_eq!(parsed.suffix, s);
        }

        #[test]
        fn prop_qf004_derive_is_deterministic(geno in ".{0,40}", pheno in ".{0,40}") {
            prop_assert_eq!(
                derive_stem(&geno, &pheno, None),
                derive_stem(&geno, &pheno, None)
            );
        }

        #[test]
        fn prop_qf004_stem_shape(
            c in name_field(), p1 in name_field(), d1 in name_field(),
            p2 in name_field(), d2 in name_field()
        ) {
            let stem = derive_stem(
                &format!("{c}-{p1}-{d1}.geno"),
                &format!("other-{p2}-{d2}.txt"),
                None,
            );
            prop_assert_eq!(stem, format!("{c}-{p1}_{d1}-{p2}_{d2}"));
        }
    }
}
