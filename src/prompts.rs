//! Prompts sent to the vision model.
//!
//! Every request is laid out as `[system preamble] [image + instruction]`.
//! The preamble is byte-identical across all pages and documents so the
//! provider can serve it from its prompt cache; anything page-specific goes
//! into the instruction instead.
//!
//! Callers can override the preamble via
//! [`crate::config::PipelineConfig::system_preamble`].

use crate::model::CategoryLabel;

/// Invariant system preamble shared by every extraction request.
pub const SYSTEM_PREAMBLE: &str = r#"You are a medical-document extraction engine running inside a parallel ingestion pipeline.
You are invoked once per page, many pages at a time, so every response must be:

FAST • SMALL • STRUCTURED • DETERMINISTIC

RULES
1. Output a single JSON object and nothing else. No prose, no markdown fences, no commentary.
2. Every page is processed independently. Never assume content from other pages.
3. Never output null. Use "Unknown" for any value that is missing or unreadable.
4. Dates in ISO 8601 (YYYY-MM-DD) when the day is known.
5. Use empty arrays when a page contains nothing of a kind. Never invent entries."#;

const PAGE_SCHEMA: &str = r#"{
 "categories":[{"name":"<category>","reason":"<1 sentence>"}],
 "medications":[{"name":"","dosage":"","frequency":"","start_date":"","is_current":"","notes":""}],
 "diagnoses":[{"description":"","code":"","diagnosed_date":"","is_current":"","doctor_first_name":"","doctor_last_name":"","facility":"","notes":""}],
 "test_results":[{"name":"","date":"","value":"","unit":"","is_abnormal":"","normal_range_low":"","normal_range_high":"","notes":""}]"#;

const SUBJECT_SCHEMA: &str = r#",
 "subject":{"first_name":"","last_name":"","date_of_birth":"","ssn":"","mrn":"","medical_facility":"","gender":"","blood_type":"","email":"","phone_number":"","address_line1":"","city":"","state":"","postal_code":"","country":"","emergency_contact_name":"","emergency_contact_phone":"","allergies":"","document_date":""}"#;

/// Build the page instruction.
///
/// `with_subject` adds the patient-demographics block; the pipeline sets it
/// only for the document's first page.
pub fn page_instruction(with_subject: bool) -> String {
    let vocabulary = CategoryLabel::VOCABULARY
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut prompt = String::from("Extract the structured records on this page. Output ONLY this JSON:\n");
    prompt.push_str(PAGE_SCHEMA);
    if with_subject {
        prompt.push_str(SUBJECT_SCHEMA);
    }
    prompt.push_str("\n}\n\n");
    prompt.push_str("Categories: ");
    prompt.push_str(&vocabulary);
    prompt.push_str("\nAssign one or more categories to the page.");
    if with_subject {
        prompt.push_str("\nFill \"subject\" with the patient this document describes.");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_block_only_when_requested() {
        assert!(page_instruction(true).contains("\"subject\""));
        assert!(!page_instruction(false).contains("\"subject\""));
    }

    #[test]
    fn instruction_lists_full_vocabulary() {
        let p = page_instruction(false);
        for c in CategoryLabel::VOCABULARY {
            assert!(p.contains(c.as_str()), "missing {c}");
        }
    }

    #[test]
    fn preamble_is_not_page_specific() {
        assert!(!SYSTEM_PREAMBLE.contains("subject"));
        assert!(!SYSTEM_PREAMBLE.contains("{"));
    }
}
