mod grpc;
mod lifecycle;
