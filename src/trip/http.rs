//! JSON-over-HTTP trip service.

use super::remote::{
    BikeStatusUpdate, MeasurementRecord, NewTrip, PlateStatusUpdate, RemoteError, RemoteFuture,
    TripClosure, TripCreated, TripDetails, TripService,
};
use log::debug;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

const API_PREFIX: &str = "api/v1/trayectos";

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Malformed(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Talks to the trip backend under `{base_url}/api/v1/trayectos/`.
pub struct HttpTripService {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTripService {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{API_PREFIX}/{path}", self.base_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!("{method} {url}");
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Response, RemoteError> {
        let response = self.request(method, path).json(body).send().await?;
        check_status(response).await
    }

    async fn send_and_read<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let response = self.send(method, path, body).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        body,
    })
}

impl TripService for HttpTripService {
    fn create_trip(&self, trip: NewTrip) -> RemoteFuture<'_, TripCreated> {
        Box::pin(async move {
            self.send_and_read(Method::POST, "iniciar-trayecto", &trip)
                .await
        })
    }

    fn trip_details(&self, trip_id: String) -> RemoteFuture<'_, TripDetails> {
        Box::pin(async move {
            let path = format!("obtener-datos-trayecto/{trip_id}");
            let response = check_status(self.request(Method::GET, &path).send().await?).await?;
            Ok(response.json().await?)
        })
    }

    fn update_bike_status(&self, update: BikeStatusUpdate) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.send(Method::PUT, "actualizar-estado-bici", &update)
                .await
                .map(drop)
        })
    }

    fn update_plate_status(&self, update: PlateStatusUpdate) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.send(Method::PUT, "actualizar-estado-placa", &update)
                .await
                .map(drop)
        })
    }

    fn save_measurement(&self, record: MeasurementRecord) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.send(Method::POST, "guardar-medida", &record)
                .await
                .map(drop)
        })
    }

    fn finalize_trip(&self, closure: TripClosure) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.send(Method::PUT, "finalizar-trayecto", &closure)
                .await
                .map(drop)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_base_and_prefix() {
        let service =
            HttpTripService::new("https://api.example.org/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            service.url("guardar-medida"),
            "https://api.example.org/api/v1/trayectos/guardar-medida"
        );
    }

    #[test]
    fn test_bearer_token_is_attached() {
        let service = HttpTripService::new(
            "http://localhost:8000",
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = service
            .request(Method::GET, "obtener-datos-trayecto/7")
            .build()
            .unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.url().as_str(),
            "http://localhost:8000/api/v1/trayectos/obtener-datos-trayecto/7"
        );
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer secret"
        );
    }
}
