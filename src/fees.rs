//! Derived student fee fields. total_amount and due_amount are never
//! independently settable; they are recomputed from the inputs whenever
//! admission type, any fee, or paid amount changes.

use crate::unique::OpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionType {
    /// Monthly tuition billing.
    Recurring,
    /// Single course fee.
    OneOff,
}

impl AdmissionType {
    pub fn parse(s: &str) -> Result<Self, OpError> {
        match s {
            "recurring" => Ok(AdmissionType::Recurring),
            "one_off" => Ok(AdmissionType::OneOff),
            other => Err(OpError::InvalidArgument(format!(
                "admissionType must be recurring or one_off, got {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionType::Recurring => "recurring",
            AdmissionType::OneOff => "one_off",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeePlan {
    pub admission_type: AdmissionType,
    pub admission_fee: f64,
    pub monthly_tuition_fee: f64,
    pub course_fee: f64,
    pub paid_amount: f64,
}

impl FeePlan {
    /// admission fee plus the tuition component the admission type selects.
    pub fn total_amount(&self) -> f64 {
        let tuition = match self.admission_type {
            AdmissionType::Recurring => self.monthly_tuition_fee,
            AdmissionType::OneOff => self.course_fee,
        };
        self.admission_fee + tuition
    }

    pub fn due_amount(&self) -> f64 {
        self.total_amount() - self.paid_amount
    }

    /// Overpayment is not permitted: due_amount never goes negative.
    pub fn validate(&self) -> Result<(), OpError> {
        for (name, v) in [
            ("admissionFee", self.admission_fee),
            ("monthlyTuitionFee", self.monthly_tuition_fee),
            ("courseFee", self.course_fee),
            ("paidAmount", self.paid_amount),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(OpError::InvalidArgument(format!(
                    "{} must be a non-negative amount",
                    name
                )));
            }
        }
        if self.paid_amount > self.total_amount() {
            return Err(OpError::InvalidArgument(
                "paidAmount exceeds the total amount".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a payment, returning the plan with the increased paid amount.
    /// Rejects non-positive amounts and amounts beyond what is due.
    pub fn apply_payment(&self, amount: f64) -> Result<FeePlan, OpError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(OpError::InvalidArgument(
                "payment amount must be positive".to_string(),
            ));
        }
        let due = self.due_amount();
        if amount > due {
            return Err(OpError::InvalidArgument(format!(
                "payment of {} exceeds due amount of {}",
                amount, due
            )));
        }
        let mut next = *self;
        next.paid_amount += amount;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recurring_plan() -> FeePlan {
        FeePlan {
            admission_type: AdmissionType::Recurring,
            admission_fee: 500.0,
            monthly_tuition_fee: 200.0,
            course_fee: 1000.0,
            paid_amount: 300.0,
        }
    }

    #[test]
    fn recurring_total_uses_monthly_tuition() {
        let plan = recurring_plan();
        assert_eq!(plan.total_amount(), 700.0);
        assert_eq!(plan.due_amount(), 400.0);
    }

    #[test]
    fn one_off_total_uses_course_fee() {
        let plan = FeePlan {
            admission_type: AdmissionType::OneOff,
            ..recurring_plan()
        };
        assert_eq!(plan.total_amount(), 1500.0);
        assert_eq!(plan.due_amount(), 1200.0);
    }

    #[test]
    fn payment_beyond_due_is_rejected() {
        let plan = recurring_plan();
        let err = plan.apply_payment(500.0).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn exact_payment_drives_due_to_zero() {
        let paid = recurring_plan().apply_payment(400.0).unwrap();
        assert_eq!(paid.due_amount(), 0.0);
        // Nothing further can be paid once settled.
        assert!(paid.apply_payment(0.01).is_err());
    }

    #[test]
    fn non_positive_payments_are_rejected() {
        let plan = recurring_plan();
        assert!(plan.apply_payment(0.0).is_err());
        assert!(plan.apply_payment(-10.0).is_err());
    }

    #[test]
    fn validate_rejects_negative_inputs_and_overpaid_state() {
        let mut plan = recurring_plan();
        assert!(plan.validate().is_ok());
        plan.admission_fee = -1.0;
        assert!(plan.validate().is_err());

        let mut plan = recurring_plan();
        plan.paid_amount = 701.0;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn admission_type_parse_roundtrip() {
        assert_eq!(
            AdmissionType::parse("recurring").unwrap(),
            AdmissionType::Recurring
        );
        assert_eq!(
            AdmissionType::parse("one_off").unwrap().as_str(),
            "one_off"
        );
        assert!(AdmissionType::parse("monthly").is_err());
    }
}
