use std::sync::Arc;

use crate::{
    clock::Clock,
    form_persist::{FormPersist, PersistOptions},
    models::{Doctor, DoctorField, DoctorFormValues, DoctorUpsert, FieldError},
    professional_info::ProfessionalInfo,
    storage::SessionStorage,
};

const MAX_YEARS_OF_EXPERIENCE: u32 = 70;

pub fn form_key(doctor_id: Option<&str>) -> String {
    format!("doctor-form:{}", doctor_id.unwrap_or("new"))
}

/// Create/edit form for a doctor record with draft persistence.
///
/// Call `mount` once before editing: it restores a draft if one exists and
/// arms the persistence latch.
pub struct DoctorForm {
    doctor_id: Option<String>,
    initial: DoctorFormValues,
    values: DoctorFormValues,
    persist: FormPersist,
}

impl DoctorForm {
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
        options: PersistOptions,
        doctor: Option<&Doctor>,
    ) -> Self {
        let doctor_id = doctor.map(|doctor| doctor.id.clone());
        let initial = doctor.map(DoctorFormValues::from).unwrap_or_default();
        let persist = FormPersist::with_clock(
            storage,
            form_key(doctor_id.as_deref()),
            clock,
            options,
        );

        Self {
            doctor_id,
            values: initial.clone(),
            initial,
            persist,
        }
    }

    /// Returns `true` when a draft was restored.
    pub fn mount(&mut self) -> bool {
        let restored = self.persist.restore::<(DoctorFormValues,)>();
        let found = restored.is_some();
        if let Some((values,)) = restored {
            self.values = values;
        }
        self.persist.on_values_changed(&(&self.values,));
        found
    }

    pub fn values(&self) -> &DoctorFormValues {
        &self.values
    }

    pub fn doctor_id(&self) -> Option<&str> {
        self.doctor_id.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.values != self.initial
    }

    pub fn set_field(&mut self, field: DoctorField, value: impl Into<String>) {
        let value = value.into();
        let slot = match field {
            DoctorField::FirstName => &mut self.values.first_name,
            DoctorField::LastName => &mut self.values.last_name,
            DoctorField::Email => &mut self.values.email,
            DoctorField::Phone => &mut self.values.phone,
            DoctorField::Specialization => &mut self.values.specialization,
            DoctorField::LicenseNumber => &mut self.values.license_number,
            DoctorField::YearsOfExperience => &mut self.values.years_of_experience,
            DoctorField::Bio => &mut self.values.bio,
        };
        *slot = value;
        self.values_changed();
    }

    pub fn set_avatar_url(&mut self, avatar_url: Option<String>) {
        self.values.avatar_url = avatar_url;
        self.values_changed();
    }

    pub fn update_professional_info<R>(&mut self, edit: impl FnOnce(&mut ProfessionalInfo) -> R) -> R {
        let mut info =
            ProfessionalInfo::new(std::mem::take(&mut self.values.professional_info));
        let result = edit(&mut info);
        self.values.professional_info = info.into_values();
        self.values_changed();
        result
    }

    pub fn validate(&self) -> Vec<FieldError> {
        let values = &self.values;
        let mut errors = Vec::new();

        let required = [
            (DoctorField::FirstName, &values.first_name, "First name is required"),
            (DoctorField::LastName, &values.last_name, "Last name is required"),
            (DoctorField::Specialization, &values.specialization, "Specialization is required"),
            (DoctorField::LicenseNumber, &values.license_number, "License number is required"),
        ];
        for (field, value, message) in required {
            if value.trim().is_empty() {
                errors.push(field_error(field, message));
            }
        }

        if !is_valid_email(values.email.trim()) {
            errors.push(field_error(DoctorField::Email, "Enter a valid email address"));
        }

        let phone = values.phone.trim();
        if !phone.is_empty()
            && !phone
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'))
        {
            errors.push(field_error(DoctorField::Phone, "Enter a valid phone number"));
        }

        if parse_years(&values.years_of_experience).is_none() {
            errors.push(field_error(
                DoctorField::YearsOfExperience,
                "Years of experience must be a whole number between 0 and 70",
            ));
        }

        errors
    }

    pub fn to_upsert(&self) -> Result<DoctorUpsert, Vec<FieldError>> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(errors);
        }

        let values = &self.values;
        Ok(DoctorUpsert {
            id: self.doctor_id.clone(),
            first_name: values.first_name.trim().to_string(),
            last_name: values.last_name.trim().to_string(),
            email: values.email.trim().to_lowercase(),
            phone: values.phone.trim().to_string(),
            specialization: values.specialization.trim().to_string(),
            license_number: values.license_number.trim().to_string(),
            years_of_experience: parse_years(&values.years_of_experience).unwrap_or_default(),
            bio: values.bio.trim().to_string(),
            avatar_url: values.avatar_url.clone(),
            professional_info: values.professional_info.clone(),
        })
    }

    /// Drops the draft so it is not resurrected on the next visit.
    pub fn submit_succeeded(&mut self) {
        self.persist.clear();
        self.initial = self.values.clone();
    }

    pub fn discard(&mut self) {
        self.persist.clear();
        self.values = self.initial.clone();
    }

    fn values_changed(&mut self) {
        self.persist.on_values_changed(&(&self.values,));
    }
}

fn field_error(field: DoctorField, message: &str) -> FieldError {
    FieldError {
        field,
        message: message.to_string(),
    }
}

fn parse_years(raw: &str) -> Option<u32> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|years| *years <= MAX_YEARS_OF_EXPERIENCE)
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
}
