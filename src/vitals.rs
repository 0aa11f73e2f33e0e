use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ConditionLikelihood;

pub const FEVER_THRESHOLD_C: f64 = 37.8;
pub const HIGH_HEART_RATE_BPM: f64 = 90.0;
pub const HIGH_SYSTOLIC_MMHG: f64 = 130.0;
pub const HIGH_DIASTOLIC_MMHG: f64 = 80.0;

pub const MIN_TEMPERATURE_C: f64 = 30.0;
pub const MAX_TEMPERATURE_C: f64 = 45.0;
pub const MIN_HEART_RATE_BPM: f64 = 20.0;
pub const MAX_HEART_RATE_BPM: f64 = 300.0;
pub const MIN_SYSTOLIC_MMHG: f64 = 50.0;
pub const MAX_SYSTOLIC_MMHG: f64 = 300.0;
pub const MIN_DIASTOLIC_MMHG: f64 = 20.0;
pub const MAX_DIASTOLIC_MMHG: f64 = 200.0;

const LIKELIHOOD_CAP: f64 = 0.95;
const MALE_RISK_FACTOR: f64 = 1.2;
const AGE_LIKELIHOOD_BASELINE: f64 = 0.3;
const AGE_LIKELIHOOD_SCALE: f64 = 0.5;
const AGE_NORMALIZER_YEARS: f64 = 80.0;
const PNEUMONIA_CONFIRMED_LIKELIHOOD: f64 = 0.95;
const COVID_FLOOR_WITH_PNEUMONIA: f64 = 0.30;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VitalsError {
    #[error("{field} out of range: {value} (expected {min} to {max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("birthdate {birthdate} is in the future")]
    FutureBirthdate { birthdate: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Some(Gender::Male),
            "female" | "f" => Some(Gender::Female),
            "other" => Some(Gender::Other),
            _ => None,
        }
    }
}

/// Everything the vitals form can capture. Every field is optional: the
/// assessment only updates on what was actually observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientVitals {
    pub birthdate: Option<NaiveDate>,
    pub gender: Option<Gender>,
    pub systolic_bp: Option<f64>,
    pub diastolic_bp: Option<f64>,
    pub temperature: Option<f64>,
    pub heart_rate: Option<f64>,
    pub has_cough: Option<bool>,
    pub has_headaches: Option<bool>,
    pub can_smell_taste: Option<bool>,
    /// Free-text notes ride along to the result view; they are never sent
    /// to the assessment and never raise severity.
    #[serde(default)]
    pub notes: Option<String>,
}

impl PatientVitals {
    pub fn validate(&self, today: NaiveDate) -> Result<(), VitalsError> {
        check_range(
            "temperature",
            self.temperature,
            MIN_TEMPERATURE_C,
            MAX_TEMPERATURE_C,
        )?;
        check_range(
            "heart rate",
            self.heart_rate,
            MIN_HEART_RATE_BPM,
            MAX_HEART_RATE_BPM,
        )?;
        check_range(
            "systolic blood pressure",
            self.systolic_bp,
            MIN_SYSTOLIC_MMHG,
            MAX_SYSTOLIC_MMHG,
        )?;
        check_range(
            "diastolic blood pressure",
            self.diastolic_bp,
            MIN_DIASTOLIC_MMHG,
            MAX_DIASTOLIC_MMHG,
        )?;

        if let Some(birthdate) = self.birthdate {
            if birthdate > today {
                return Err(VitalsError::FutureBirthdate { birthdate });
            }
        }

        Ok(())
    }

    pub fn has_any_signal(&self) -> bool {
        self.birthdate.is_some()
            || self.gender.is_some()
            || self.systolic_bp.is_some()
            || self.diastolic_bp.is_some()
            || self.temperature.is_some()
            || self.heart_rate.is_some()
            || self.has_cough.is_some()
            || self.has_headaches.is_some()
            || self.can_smell_taste.is_some()
    }

    pub fn has_fever(&self) -> Option<bool> {
        self.temperature.map(|t| t > FEVER_THRESHOLD_C)
    }

    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        self.birthdate.map(|birthdate| age_on(birthdate, today))
    }
}

fn check_range(
    field: &'static str,
    value: Option<f64>,
    min: f64,
    max: f64,
) -> Result<(), VitalsError> {
    if let Some(value) = value {
        if !(min..=max).contains(&value) {
            return Err(VitalsError::OutOfRange {
                field,
                value,
                min,
                max,
            });
        }
    }
    Ok(())
}

pub fn age_on(birthdate: NaiveDate, today: NaiveDate) -> u32 {
    if birthdate > today {
        return 0;
    }
    let mut years = today.year() - birthdate.year();
    if (today.month(), today.day()) < (birthdate.month(), birthdate.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

/// Which findings were observed, derived from raw vitals. `None` means the
/// finding was not measured and must not move the estimate either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymptomObservations {
    pub cough: Option<bool>,
    pub headache: Option<bool>,
    pub loss_of_smell: Option<bool>,
    pub fever: Option<bool>,
    pub high_heart_rate: Option<bool>,
    pub high_blood_pressure: Option<bool>,
}

impl SymptomObservations {
    pub fn from_vitals(vitals: &PatientVitals) -> Self {
        let high_blood_pressure = match (vitals.systolic_bp, vitals.diastolic_bp) {
            (None, None) => None,
            (systolic, diastolic) => Some(
                systolic.is_some_and(|s| s > HIGH_SYSTOLIC_MMHG)
                    || diastolic.is_some_and(|d| d > HIGH_DIASTOLIC_MMHG),
            ),
        };

        Self {
            cough: vitals.has_cough,
            headache: vitals.has_headaches,
            loss_of_smell: vitals.can_smell_taste.map(|can| !can),
            fever: vitals.has_fever(),
            high_heart_rate: vitals.heart_rate.map(|hr| hr > HIGH_HEART_RATE_BPM),
            high_blood_pressure,
        }
    }
}

struct SymptomRates {
    cough: f64,
    headache: f64,
    loss_of_smell: f64,
    fever: f64,
    high_heart_rate: f64,
    high_blood_pressure: f64,
}

struct ConditionProfile {
    name: &'static str,
    prior: f64,
    rates: SymptomRates,
}

const BASE_RATES: SymptomRates = SymptomRates {
    cough: 0.15,
    headache: 0.25,
    loss_of_smell: 0.10,
    fever: 0.05,
    high_heart_rate: 0.10,
    high_blood_pressure: 0.20,
};

const CONDITION_PROFILES: [ConditionProfile; 2] = [
    ConditionProfile {
        name: "Covid-19",
        prior: 0.05,
        rates: SymptomRates {
            cough: 0.65,
            headache: 0.60,
            loss_of_smell: 0.70,
            fever: 0.75,
            high_heart_rate: 0.40,
            high_blood_pressure: 0.30,
        },
    },
    ConditionProfile {
        name: "Pneumonia",
        prior: 0.03,
        rates: SymptomRates {
            cough: 0.80,
            headache: 0.35,
            loss_of_smell: 0.10,
            fever: 0.80,
            high_heart_rate: 0.60,
            high_blood_pressure: 0.25,
        },
    },
];

/// Naive-Bayes style estimate of condition likelihoods from observed
/// findings, age, and gender. A confirmed radiological pneumonia finding
/// overrides the pneumonia estimate outright and floors the Covid-19 one.
pub fn assess_conditions(
    vitals: &PatientVitals,
    today: NaiveDate,
    has_pneumonia: bool,
) -> Vec<ConditionLikelihood> {
    let observations = SymptomObservations::from_vitals(vitals);
    let age = vitals.age_on(today);

    CONDITION_PROFILES
        .iter()
        .map(|profile| {
            let mut p = profile.prior;

            let updates = [
                (observations.cough, profile.rates.cough, BASE_RATES.cough),
                (
                    observations.headache,
                    profile.rates.headache,
                    BASE_RATES.headache,
                ),
                (
                    observations.loss_of_smell,
                    profile.rates.loss_of_smell,
                    BASE_RATES.loss_of_smell,
                ),
                (observations.fever, profile.rates.fever, BASE_RATES.fever),
                (
                    observations.high_heart_rate,
                    profile.rates.high_heart_rate,
                    BASE_RATES.high_heart_rate,
                ),
                (
                    observations.high_blood_pressure,
                    profile.rates.high_blood_pressure,
                    BASE_RATES.high_blood_pressure,
                ),
            ];

            for (observed, likelihood, base_rate) in updates {
                match observed {
                    Some(true) => p = p * likelihood / base_rate,
                    Some(false) => p = p * (1.0 - likelihood) / (1.0 - base_rate),
                    None => {}
                }
            }

            if let Some(age) = age {
                let age_factor = (age as f64 / AGE_NORMALIZER_YEARS).min(1.0);
                let age_likelihood = AGE_LIKELIHOOD_BASELINE + AGE_LIKELIHOOD_SCALE * age_factor;
                p = p * age_likelihood / (p * age_likelihood + (1.0 - p) * (1.0 - age_likelihood));
            }

            if vitals.gender == Some(Gender::Male) {
                p = p * MALE_RISK_FACTOR / (p * MALE_RISK_FACTOR + (1.0 - p));
            }

            if has_pneumonia {
                p = match profile.name {
                    "Pneumonia" => PNEUMONIA_CONFIRMED_LIKELIHOOD,
                    _ => p.max(COVID_FLOOR_WITH_PNEUMONIA),
                };
            }

            ConditionLikelihood {
                condition: profile.name.to_string(),
                percent: round2(p.min(LIKELIHOOD_CAP) * 100.0),
            }
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
