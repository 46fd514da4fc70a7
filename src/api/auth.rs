//! Shared-secret authentication for every route.
//!
//! Callers (the scheduler, the dispatch table's own trigger calls, and the
//! dashboard backend) present the configured secret in `x-api-secret`.

use std::future::{Future, Ready};
use std::pin::Pin;
use std::rc::Rc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::web::Data;

use crate::{dispatch::SECRET_HEADER, error::Error, signing};

pub struct SecretAuth;

impl<S, B> Transform<S, ServiceRequest> for SecretAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = SecretAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(SecretAuthMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct SecretAuthMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for SecretAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = Rc::clone(&self.service);

        Box::pin(async move {
            let service = req
                .app_data::<Data<crate::service::Service>>()
                .expect("service state not found; this is a bug")
                .clone();

            let rejection = match req
                .headers()
                .get(SECRET_HEADER)
                .and_then(|value| value.to_str().ok())
            {
                None => Some(Error::MissingHeader {
                    header: SECRET_HEADER.to_owned(),
                }),
                Some(presented) => {
                    if signing::secret_eq(
                        presented.as_bytes(),
                        service.config().api_secret.as_bytes(),
                    ) {
                        None
                    } else {
                        Some(Error::Unauthorized)
                    }
                }
            };

            if let Some(err) = rejection {
                return Ok(req.error_response(err).map_into_right_body());
            }

            svc.call(req).await.map(ServiceResponse::map_into_left_body)
        })
    }
}
