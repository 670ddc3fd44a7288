pub mod blendshape_extractor;
pub mod downscale;
pub mod engine_factory;
pub mod eos_engine;
pub mod execution_provider;
pub mod face_box_detector;
pub mod face_landmarker;
pub mod face_mesh_engine;
pub mod haar_engine;
pub mod insightface_engine;
pub mod math;
pub mod model_fetcher;
pub mod model_registry;
pub mod openseeface_engine;
pub mod pyfeat_engine;
pub mod throttle;
pub mod yolo_object_detector;
pub mod yunet_engine;
