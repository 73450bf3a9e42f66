use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Arc<Vec<u8>>,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: Arc::new(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Doctor {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub specialization: String,
    pub license_number: String,
    pub years_of_experience: u32,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub professional_info: ProfessionalInfoValues,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfessionalInfoValues {
    #[serde(default)]
    pub qualifications: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorFormValues {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub specialization: String,
    pub license_number: String,
    pub years_of_experience: String,
    pub bio: String,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub professional_info: ProfessionalInfoValues,
}

impl From<&Doctor> for DoctorFormValues {
    fn from(doctor: &Doctor) -> Self {
        Self {
            first_name: doctor.first_name.clone(),
            last_name: doctor.last_name.clone(),
            email: doctor.email.clone(),
            phone: doctor.phone.clone(),
            specialization: doctor.specialization.clone(),
            license_number: doctor.license_number.clone(),
            years_of_experience: doctor.years_of_experience.to_string(),
            bio: doctor.bio.clone(),
            avatar_url: doctor.avatar_url.clone(),
            professional_info: doctor.professional_info.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DoctorField {
    FirstName,
    LastName,
    Email,
    Phone,
    Specialization,
    LicenseNumber,
    YearsOfExperience,
    Bio,
}

impl DoctorField {
    pub fn as_key(self) -> &'static str {
        match self {
            Self::FirstName => "firstName",
            Self::LastName => "lastName",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Specialization => "specialization",
            Self::LicenseNumber => "licenseNumber",
            Self::YearsOfExperience => "yearsOfExperience",
            Self::Bio => "bio",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: DoctorField,
    pub message: String,
}

/// Validated payload handed to the REST client on submit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorUpsert {
    pub id: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub specialization: String,
    pub license_number: String,
    pub years_of_experience: u32,
    pub bio: String,
    pub avatar_url: Option<String>,
    pub professional_info: ProfessionalInfoValues,
}
