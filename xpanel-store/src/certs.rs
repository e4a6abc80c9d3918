use chrono::{DateTime, Utc};
use xpanel_core::{Error, Result};

use crate::model::{CertStatus, Certificate, CertificateRow, NewCertificate};
use crate::{map_db_err, row_or_not_found, Store};

const CERT_COLUMNS: &str =
    "id, domain, cert_path, key_path, status, last_checked, last_renewed, expires_at";

impl Store {
    pub async fn create_certificate(&self, new: NewCertificate) -> Result<Certificate> {
        if new.domain.trim().is_empty() {
            return Err(Error::bad_request("domain must not be empty"));
        }
        sqlx::query(
            "INSERT INTO certificates (domain, cert_path, key_path, status) VALUES (?, ?, ?, 'unknown')",
        )
        .bind(&new.domain)
        .bind(&new.cert_path)
        .bind(&new.key_path)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        self.certificate_by_domain(&new.domain).await
    }

    pub async fn certificate_by_domain(&self, domain: &str) -> Result<Certificate> {
        let row = sqlx::query_as::<_, CertificateRow>(&format!(
            "SELECT {CERT_COLUMNS} FROM certificates WHERE domain = ?"
        ))
        .bind(domain)
        .fetch_optional(self.pool())
        .await;
        row_or_not_found(row, "certificate")?.try_into()
    }

    pub async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        let rows = sqlx::query_as::<_, CertificateRow>(&format!(
            "SELECT {CERT_COLUMNS} FROM certificates ORDER BY domain"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;
        rows.into_iter().map(Certificate::try_from).collect()
    }

    pub async fn update_certificate_status(
        &self,
        domain: &str,
        status: CertStatus,
        last_checked: Option<DateTime<Utc>>,
        last_renewed: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE certificates SET status = ?, \
             last_checked = COALESCE(?, last_checked), \
             last_renewed = COALESCE(?, last_renewed), \
             expires_at = COALESCE(?, expires_at) \
             WHERE domain = ?",
        )
        .bind(status.as_str())
        .bind(last_checked)
        .bind(last_renewed)
        .bind(expires_at)
        .bind(domain)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?
        .rows_affected();

        if affected == 0 {
            return Err(Error::not_found("certificate"));
        }
        Ok(())
    }

    pub async fn delete_certificate(&self, domain: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM certificates WHERE domain = ?")
            .bind(domain)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::not_found("certificate"));
        }
        Ok(())
    }
}
