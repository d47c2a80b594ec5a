extern crate alloc;

use alloc::vec::Vec;
use core::cmp::Ordering;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::{PurchaseRecord, ReceiptPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PurchaseError {
    #[error("Product is cancelled!")]
    ProductIsCancelled,
    #[error("Product has no expiration date and is not auto-renewable!")]
    NotAutoRenewableProduct,
    #[error("Product was not purchased!")]
    ProductNotPurchased,
    #[error("Product has an expiration date and is not non-renewable!")]
    NotNonRenewableProduct,
    #[error("Purchase date is not available!")]
    PurchaseDateNotAvailable,
    #[error("Expiration date is not available!")]
    ExpireDateNotAvailable,
}

/// Validity window of a non-renewing product.
/// A month counts 30 days, a year 365 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonRenewablePeriod {
    Days(u32),
    Months(u32),
    Years(u32),
}

impl NonRenewablePeriod {
    #[must_use]
    pub fn days(&self) -> i64 {
        match self {
            Self::Days(days) => i64::from(*days),
            Self::Months(months) => i64::from(*months) * 30,
            Self::Years(years) => i64::from(*years) * 365,
        }
    }
}

impl PurchaseRecord {
    /// Whether the subscription runs at `as_of`, that is
    /// `purchase_date <= as_of < expires_date`.
    pub fn is_active_auto_renewable(&self, as_of: DateTime<Utc>) -> Result<bool, PurchaseError> {
        if self.cancellation_date.is_some() {
            return Err(PurchaseError::ProductIsCancelled);
        }
        let expires = self
            .expires_date
            .ok_or(PurchaseError::NotAutoRenewableProduct)?;
        let purchased = self
            .purchase_date
            .ok_or(PurchaseError::ProductNotPurchased)?;
        Ok(purchased <= as_of && as_of < expires)
    }

    fn is_product(&self, product_id: &str) -> bool {
        self.product_identifier.as_deref() == Some(product_id)
    }
}

/// Default order of purchase lists: most recent first.
/// Records without a purchase date come before all dated ones.
#[must_use]
pub fn by_purchase_date_descending(a: &PurchaseRecord, b: &PurchaseRecord) -> Ordering {
    match (a.purchase_date, b.purchase_date) {
        (Some(a), Some(b)) => b.cmp(&a),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl ReceiptPayload {
    #[must_use]
    pub fn contains_purchase(&self, product_id: &str) -> bool {
        self.purchases.iter().any(|record| record.is_product(product_id))
    }

    /// Purchases of `product_id`, most recent first.
    #[must_use]
    pub fn all_purchases_by_product_id(&self, product_id: &str) -> Vec<&PurchaseRecord> {
        self.all_purchases_by_product_id_sorted_by(product_id, by_purchase_date_descending)
    }

    pub fn all_purchases_by_product_id_sorted_by<F>(
        &self,
        product_id: &str,
        mut compare: F,
    ) -> Vec<&PurchaseRecord>
    where
        F: FnMut(&PurchaseRecord, &PurchaseRecord) -> Ordering,
    {
        let mut records: Vec<&PurchaseRecord> = self
            .purchases
            .iter()
            .filter(|record| record.is_product(product_id))
            .collect();
        records.sort_by(|a, b| compare(a, b));
        records
    }

    #[must_use]
    pub fn all_auto_renewables(&self) -> Vec<&PurchaseRecord> {
        self.purchases
            .iter()
            .filter(|record| record.expires_date.is_some())
            .collect()
    }

    #[must_use]
    pub fn active_auto_renewables(&self) -> Vec<&PurchaseRecord> {
        self.active_auto_renewables_at(Utc::now())
    }

    /// Auto-renewables active at `as_of`. Records that fail the check,
    /// e.g. cancelled ones, are left out.
    #[must_use]
    pub fn active_auto_renewables_at(&self, as_of: DateTime<Utc>) -> Vec<&PurchaseRecord> {
        self.all_auto_renewables()
            .into_iter()
            .filter(|record| record.is_active_auto_renewable(as_of).unwrap_or(false))
            .collect()
    }

    /// Most recent purchase of `product_id` active at `as_of`. Purchases
    /// are checked most recent first; the first one failing the check,
    /// e.g. a cancelled one, fails the query.
    pub fn active_auto_renewable(
        &self,
        product_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<&PurchaseRecord>, PurchaseError> {
        for record in self.all_purchases_by_product_id(product_id) {
            if record.is_active_auto_renewable(as_of)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub fn currently_active_auto_renewable(
        &self,
        product_id: &str,
    ) -> Result<Option<&PurchaseRecord>, PurchaseError> {
        self.active_auto_renewable(product_id, Utc::now())
    }

    fn most_recent(&self, product_id: &str) -> Result<&PurchaseRecord, PurchaseError> {
        self.all_purchases_by_product_id(product_id)
            .first()
            .copied()
            .ok_or(PurchaseError::ProductNotPurchased)
    }

    pub fn original_transaction_identifier(
        &self,
        product_id: &str,
    ) -> Result<Option<&str>, PurchaseError> {
        Ok(self
            .most_recent(product_id)?
            .original_transaction_identifier
            .as_deref())
    }

    pub fn purchase_expiration_date(
        &self,
        product_id: &str,
    ) -> Result<DateTime<Utc>, PurchaseError> {
        self.most_recent(product_id)?
            .expires_date
            .ok_or(PurchaseError::ExpireDateNotAvailable)
    }

    /// Whether the most recent purchase of a non-renewing product is
    /// still inside its validity `period` at `as_of`.
    pub fn is_non_renewable_active_for(
        &self,
        product_id: &str,
        period: NonRenewablePeriod,
        as_of: DateTime<Utc>,
    ) -> Result<bool, PurchaseError> {
        let record = self.most_recent(product_id)?;
        if record.expires_date.is_some() {
            return Err(PurchaseError::NotNonRenewableProduct);
        }
        let purchased = record
            .purchase_date
            .ok_or(PurchaseError::PurchaseDateNotAvailable)?;
        // a window ending past the representable range never closes
        Ok(TimeDelta::try_days(period.days())
            .and_then(|validity| purchased.checked_add_signed(validity))
            .map_or(true, |end| end > as_of))
    }

    pub fn is_non_renewable_active(
        &self,
        product_id: &str,
        days: u32,
        as_of: DateTime<Utc>,
    ) -> Result<bool, PurchaseError> {
        self.is_non_renewable_active_for(product_id, NonRenewablePeriod::Days(days), as_of)
    }

    pub fn is_non_renewable_active_for_months(
        &self,
        product_id: &str,
        months: u32,
        as_of: DateTime<Utc>,
    ) -> Result<bool, PurchaseError> {
        self.is_non_renewable_active_for(product_id, NonRenewablePeriod::Months(months), as_of)
    }

    pub fn is_non_renewable_active_for_years(
        &self,
        product_id: &str,
        years: u32,
        as_of: DateTime<Utc>,
    ) -> Result<bool, PurchaseError> {
        self.is_non_renewable_active_for(product_id, NonRenewablePeriod::Years(years), as_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::tests::{load, SUBSCRIPTION_RECEIPT};
    use alloc::string::String;
    use chrono::TimeZone;

    const YEARLY: &str = "com.bjitgroup.easypurchase.autorenewyearly";
    const WEEKLY: &str = "com.bjitgroup.easypurchase.autorenewweekly";
    const TWENTY: &str = "com.bjitgroup.easypurchase.nonRenewable.twenty";

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn record(purchase: Option<DateTime<Utc>>, expires: Option<DateTime<Utc>>) -> PurchaseRecord {
        PurchaseRecord {
            product_identifier: Some(String::from("product")),
            purchase_date: purchase,
            expires_date: expires,
            ..Default::default()
        }
    }

    #[test]
    fn checks_auto_renewable_window() {
        let now = at(2023, 11, 29, 9, 50, 0);
        let active = record(Some(now), Some(now + TimeDelta::seconds(10)));
        assert_eq!(Ok(true), active.is_active_auto_renewable(now));
        assert_eq!(
            Ok(false),
            active.is_active_auto_renewable(now + TimeDelta::seconds(10))
        );
        assert_eq!(
            Ok(false),
            active.is_active_auto_renewable(now - TimeDelta::seconds(1))
        );
        let cancelled = PurchaseRecord {
            cancellation_date: Some(now),
            ..active.clone()
        };
        assert_eq!(
            Err(PurchaseError::ProductIsCancelled),
            cancelled.is_active_auto_renewable(now)
        );
        assert_eq!(
            Err(PurchaseError::NotAutoRenewableProduct),
            record(Some(now), None).is_active_auto_renewable(now)
        );
        assert_eq!(
            Err(PurchaseError::ProductNotPurchased),
            record(None, Some(now)).is_active_auto_renewable(now)
        );
    }

    #[test]
    fn orders_by_purchase_date_descending() {
        let earlier = record(Some(at(2023, 1, 1, 0, 0, 0)), None);
        let later = record(Some(at(2023, 6, 1, 0, 0, 0)), None);
        let undated = record(None, None);
        let payload = ReceiptPayload {
            purchases: alloc::vec![earlier.clone(), undated.clone(), later.clone()],
            ..Default::default()
        };
        assert_eq!(
            alloc::vec![&undated, &later, &earlier],
            payload.all_purchases_by_product_id("product")
        );
        let ascending = payload.all_purchases_by_product_id_sorted_by("product", |a, b| {
            by_purchase_date_descending(b, a)
        });
        assert_eq!(alloc::vec![&earlier, &later, &undated], ascending);
        assert!(payload.all_purchases_by_product_id("other").is_empty());
    }

    #[test]
    fn excludes_failing_records_from_active_list() {
        let now = at(2023, 11, 29, 9, 50, 0);
        let running = record(Some(now), Some(now + TimeDelta::days(1)));
        let cancelled = PurchaseRecord {
            cancellation_date: Some(now),
            ..running.clone()
        };
        let undated = record(None, Some(now + TimeDelta::days(1)));
        let payload = ReceiptPayload {
            purchases: alloc::vec![cancelled, undated, record(Some(now), None), running.clone()],
            ..Default::default()
        };
        assert_eq!(3, payload.all_auto_renewables().len());
        assert_eq!(alloc::vec![&running], payload.active_auto_renewables_at(now));
        // the undated record sorts first
        assert_eq!(
            Err(PurchaseError::ProductNotPurchased),
            payload.active_auto_renewable("product", now)
        );
        assert_eq!(Ok(None), payload.active_auto_renewable("other", now));
    }

    #[test]
    fn picks_most_recent_active_auto_renewable() {
        let now = at(2023, 11, 29, 9, 50, 0);
        let older = record(Some(now - TimeDelta::days(2)), Some(now + TimeDelta::days(5)));
        let newer = record(Some(now - TimeDelta::days(1)), Some(now + TimeDelta::days(4)));
        let expired = record(Some(now - TimeDelta::days(9)), Some(now - TimeDelta::days(2)));
        let payload = ReceiptPayload {
            purchases: alloc::vec![older.clone(), expired, newer.clone()],
            ..Default::default()
        };
        assert_eq!(Ok(Some(&newer)), payload.active_auto_renewable("product", now));
        assert_eq!(
            Ok(Some(&older)),
            payload.active_auto_renewable("product", now + TimeDelta::hours(108))
        );
        assert_eq!(
            Ok(None),
            payload.active_auto_renewable("product", now + TimeDelta::days(7))
        );

        let cancelled = PurchaseRecord {
            cancellation_date: Some(now),
            ..record(Some(now), Some(now + TimeDelta::days(7)))
        };
        let payload = ReceiptPayload {
            purchases: alloc::vec![newer, cancelled],
            ..Default::default()
        };
        assert_eq!(
            Err(PurchaseError::ProductIsCancelled),
            payload.active_auto_renewable("product", now)
        );
        assert_eq!(
            Err(PurchaseError::ProductIsCancelled),
            payload.currently_active_auto_renewable("product")
        );
    }

    #[test]
    fn queries_subscription_receipt() {
        let receipt = load(SUBSCRIPTION_RECEIPT);
        let payload = receipt.payload();
        assert!(payload.contains_purchase(YEARLY));
        assert!(payload.contains_purchase("com.bjitgroup.easypurchase.nonconsumable.levelone"));
        assert!(!payload.contains_purchase("com.bjitgroup.easypurchase.unknown"));
        assert_eq!(20, payload.all_auto_renewables().len());

        let yearly = payload.all_purchases_by_product_id(YEARLY);
        assert_eq!(12, yearly.len());
        assert_eq!(Some(at(2023, 11, 28, 13, 37, 32)), yearly[0].purchase_date);
        assert_eq!(Some(at(2023, 11, 28, 3, 33, 44)), yearly[11].purchase_date);
        assert_eq!(8, payload.all_purchases_by_product_id(WEEKLY).len());

        assert_eq!(
            Ok(at(2023, 11, 28, 14, 37, 32)),
            payload.purchase_expiration_date(YEARLY)
        );
        assert_eq!(
            Err(PurchaseError::ExpireDateNotAvailable),
            payload.purchase_expiration_date(TWENTY)
        );
        assert_eq!(
            Ok(Some("2000000467310951")),
            payload.original_transaction_identifier(WEEKLY)
        );
        assert_eq!(
            Err(PurchaseError::ProductNotPurchased),
            payload.original_transaction_identifier("com.bjitgroup.easypurchase.unknown")
        );
    }

    #[test]
    fn finds_active_subscriptions_in_receipt() {
        let receipt = load(SUBSCRIPTION_RECEIPT);
        let payload = receipt.payload();
        let as_of = at(2023, 11, 29, 9, 50, 0);
        let active = payload.active_auto_renewables_at(as_of);
        assert_eq!(1, active.len());
        assert_eq!(
            Some("2000000468564060"),
            active[0].transaction_identifier.as_deref()
        );
        assert_eq!(Ok(Some(active[0])), payload.active_auto_renewable(WEEKLY, as_of));
        assert_eq!(Ok(None), payload.active_auto_renewable(YEARLY, as_of));
        assert_eq!(
            Some(at(2023, 11, 28, 13, 37, 32)),
            payload
                .active_auto_renewable(YEARLY, at(2023, 11, 28, 14, 0, 0))
                .unwrap()
                .and_then(|record| record.purchase_date)
        );
        assert!(payload.active_auto_renewables().is_empty());
        assert_eq!(Ok(None), payload.currently_active_auto_renewable(WEEKLY));
    }

    #[test]
    fn checks_non_renewable_validity() {
        let receipt = load(SUBSCRIPTION_RECEIPT);
        let payload = receipt.payload();
        // most recent purchase: 2023-11-28T06:22:28Z
        assert_eq!(
            Ok(true),
            payload.is_non_renewable_active(TWENTY, 30, at(2023, 12, 1, 0, 0, 0))
        );
        assert_eq!(
            Ok(false),
            payload.is_non_renewable_active(TWENTY, 30, at(2023, 12, 28, 6, 22, 28))
        );
        assert_eq!(
            Ok(true),
            payload.is_non_renewable_active_for_months(TWENTY, 1, at(2023, 12, 28, 6, 22, 27))
        );
        assert_eq!(
            Ok(false),
            payload.is_non_renewable_active_for_months(TWENTY, 1, at(2024, 1, 1, 0, 0, 0))
        );
        assert_eq!(
            Ok(true),
            payload.is_non_renewable_active_for_years(TWENTY, 1, at(2024, 11, 1, 0, 0, 0))
        );
        assert_eq!(
            Err(PurchaseError::NotNonRenewableProduct),
            payload.is_non_renewable_active(YEARLY, 30, at(2023, 12, 1, 0, 0, 0))
        );
        assert_eq!(
            Err(PurchaseError::ProductNotPurchased),
            payload.is_non_renewable_active("com.bjitgroup.easypurchase.unknown", 30, Utc::now())
        );
        assert_eq!(
            Ok(true),
            payload.is_non_renewable_active_for(
                TWENTY,
                NonRenewablePeriod::Years(u32::MAX),
                at(2030, 1, 1, 0, 0, 0)
            )
        );
    }

    #[test]
    fn reports_missing_purchase_date() {
        let payload = ReceiptPayload {
            purchases: alloc::vec![record(None, None)],
            ..Default::default()
        };
        assert_eq!(
            Err(PurchaseError::PurchaseDateNotAvailable),
            payload.is_non_renewable_active("product", 1, Utc::now())
        );
        assert_eq!(30, NonRenewablePeriod::Months(1).days());
        assert_eq!(730, NonRenewablePeriod::Years(2).days());
    }
}
