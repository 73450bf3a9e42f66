use crate::models::ProfessionalInfoValues;

/// Editable qualification and language lists of a doctor profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfessionalInfo {
    values: ProfessionalInfoValues,
}

impl ProfessionalInfo {
    pub fn new(values: ProfessionalInfoValues) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &ProfessionalInfoValues {
        &self.values
    }

    pub fn into_values(self) -> ProfessionalInfoValues {
        self.values
    }

    /// Returns `false` when the entry is blank or already listed.
    pub fn add_qualification(&mut self, qualification: &str) -> bool {
        push_unique(&mut self.values.qualifications, qualification)
    }

    pub fn remove_qualification(&mut self, index: usize) -> Option<String> {
        remove_at(&mut self.values.qualifications, index)
    }

    pub fn add_language(&mut self, language: &str) -> bool {
        push_unique(&mut self.values.languages, language)
    }

    pub fn remove_language(&mut self, index: usize) -> Option<String> {
        remove_at(&mut self.values.languages, index)
    }
}

fn push_unique(items: &mut Vec<String>, candidate: &str) -> bool {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return false;
    }
    let lowered = candidate.to_lowercase();
    if items.iter().any(|item| item.to_lowercase() == lowered) {
        return false;
    }
    items.push(candidate.to_string());
    true
}

fn remove_at(items: &mut Vec<String>, index: usize) -> Option<String> {
    (index < items.len()).then(|| items.remove(index))
}
